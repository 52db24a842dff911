use crate::value::SymbolId;

/// Where a lexical variable lives at run time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LexAddr {
    /// Frames to walk outward from the innermost.
    pub frame: usize,
    pub slot: usize,
    /// The variable is a `&rest` parameter: it names every slot from `slot`
    /// onward as a list.
    pub rest: bool,
}

/// The parameter names of one environment frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LexFrame {
    pub names: Vec<SymbolId>,
    /// Index into `names` of the `&rest` parameter, always the last one.
    pub rest: Option<usize>,
}

impl LexFrame {
    pub fn new(names: Vec<SymbolId>) -> Self {
        LexFrame { names, rest: None }
    }

    pub fn with_rest(names: Vec<SymbolId>, rest: Option<usize>) -> Self {
        LexFrame { names, rest }
    }
}

/// The compile-time mirror of E: frames innermost last.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LexEnv {
    frames: Vec<LexFrame>,
}

impl LexEnv {
    pub fn new() -> Self {
        LexEnv { frames: Vec::new() }
    }

    /// A new environment with `frame` as its innermost frame.
    pub fn extend(&self, frame: LexFrame) -> LexEnv {
        let mut frames = self.frames.clone();
        frames.push(frame);
        LexEnv { frames }
    }

    /// Find the innermost binding of `name`. Within a frame the later of two
    /// equal names shadows the earlier.
    pub fn resolve(&self, name: SymbolId) -> Option<LexAddr> {
        for (depth, frame) in self.frames.iter().rev().enumerate() {
            if let Some(slot) = frame.names.iter().rposition(|&n| n == name) {
                return Some(LexAddr {
                    frame: depth,
                    slot,
                    rest: frame.rest == Some(slot),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_frames_shadow_outer() {
        let (x, y) = (SymbolId(100), SymbolId(101));
        let env = LexEnv::new()
            .extend(LexFrame::new(vec![x, y]))
            .extend(LexFrame::new(vec![y]));
        assert_eq!(
            env.resolve(y),
            Some(LexAddr { frame: 0, slot: 0, rest: false })
        );
        assert_eq!(
            env.resolve(x),
            Some(LexAddr { frame: 1, slot: 0, rest: false })
        );
        assert_eq!(env.resolve(SymbolId(102)), None);
    }

    #[test]
    fn rest_slot_is_flagged() {
        let (a, more) = (SymbolId(100), SymbolId(101));
        let env = LexEnv::new().extend(LexFrame::with_rest(vec![a, more], Some(1)));
        assert!(env.resolve(more).map_or(false, |addr| addr.rest));
        assert!(!env.resolve(a).map_or(true, |addr| addr.rest));
    }
}
