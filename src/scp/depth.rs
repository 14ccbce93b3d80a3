/// Number of directories currently open on the wire.
///
/// Every `D` record pushes one level and every `E` record leaves one. The
/// counter never goes below zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DepthCounter {
    depth: usize,
}

impl DepthCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn push(&mut self) -> usize {
        self.depth += 1;
        self.depth
    }

    /// Leave one level. Returns `false` (and stays at zero) when nothing is
    /// open.
    pub fn leave(&mut self) -> bool {
        if self.depth == 0 {
            return false;
        }
        self.depth -= 1;
        true
    }

    /// How many `leave` calls it takes to get down to `target`.
    pub fn levels_above(&self, target: usize) -> usize {
        self.depth.saturating_sub(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leave_by_one_and_never_negative() {
        let mut depth = DepthCounter::new();
        assert!(!depth.leave());
        assert_eq!(depth.depth(), 0);

        assert_eq!(depth.push(), 1);
        assert_eq!(depth.push(), 2);
        assert_eq!(depth.levels_above(0), 2);
        assert_eq!(depth.levels_above(5), 0);

        assert!(depth.leave());
        assert_eq!(depth.depth(), 1);
        assert!(depth.leave());
        assert_eq!(depth.depth(), 0);
        assert!(!depth.leave());
        assert_eq!(depth.depth(), 0);
    }
}
