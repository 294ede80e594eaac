use std::collections::VecDeque;

/// Retains only the last `CAP` bytes written to it, used to cap stderr
/// retained for error reports while full output is still logged as it
/// streams (spec §4.4: "retaining only the last 64 KiB for error reports").
pub struct RingTail {
    buf: VecDeque<u8>,
    cap: usize,
}

impl RingTail {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        for byte in line.as_bytes() {
            if self.buf.len() == self.cap {
                self.buf.pop_front();
            }
            self.buf.push_back(*byte);
        }
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(b'\n');
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.buf.iter().copied().collect::<Vec<u8>>()).into_owned()
    }
}

pub const STDERR_TAIL_CAP: usize = 64 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_at_capacity() {
        let mut tail = RingTail::new(16);
        for i in 0..10 {
            tail.push_line(&format!("line{i}"));
        }
        assert!(tail.as_string().len() <= 16);
    }
}
