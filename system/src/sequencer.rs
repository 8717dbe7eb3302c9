use crate::types::SequenceNumber;

/// Room-scoped source of the total order. Owned by a single room actor, so
/// callers are serialized by construction and `next` can never block or fail.
#[derive(Debug)]
pub struct Sequencer {
    next: SequenceNumber,
}

impl Sequencer {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Resume above the highest durably recorded sequence number.
    pub fn resume_after(sequence: SequenceNumber) -> Self {
        Self { next: sequence + 1 }
    }

    pub fn next(&mut self) -> SequenceNumber {
        let assigned = self.next;
        self.next += 1;
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_starts_at_one_and_increases_strictly() {
        let mut sequencer = Sequencer::new();
        assert_eq!(sequencer.next(), 1);
        assert_eq!(sequencer.next(), 2);
        assert_eq!(sequencer.next(), 3);
    }

    #[test]
    fn it_resumes_above_recorded_sequence() {
        let mut sequencer = Sequencer::resume_after(41);
        assert_eq!(sequencer.next(), 42);
    }
}
