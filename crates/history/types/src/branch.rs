use serde::{Deserialize, Serialize};

/// Opaque handle to a history branch, assigned by the history store.
///
/// The reset core never looks inside a token; it only passes tokens between
/// the store, version histories and mutable state.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchToken(pub Vec<u8>);

impl BranchToken {
    /// Wrap raw token bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Token of a run that predates branches.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for BranchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BranchToken({} bytes)", self.0.len())
    }
}

impl std::fmt::Display for BranchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0.iter().take(8) {
            write!(f, "{:02x}", b)?;
        }
        if self.0.len() > 8 {
            write!(f, "...")?;
        }
        Ok(())
    }
}
