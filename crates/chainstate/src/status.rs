//! Validation progress of a block index entry.

/// Milestones a block passes through, in increasing order of rigor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum BlockValidity {
    #[default]
    Unknown = 0,
    /// Header parsed and proof of work checked.
    Header = 1,
    /// Predecessor known, contextual header checks passed.
    Tree = 2,
    /// Transactions downloaded, merkle root and context-free checks passed.
    Transactions = 3,
    /// Outputs spendable, no double spends, block-level context checks passed.
    Chain = 4,
    /// Scripts and signatures verified.
    Scripts = 5,
}

impl BlockValidity {
    pub const ALL: [BlockValidity; 6] = [
        BlockValidity::Unknown,
        BlockValidity::Header,
        BlockValidity::Tree,
        BlockValidity::Transactions,
        BlockValidity::Chain,
        BlockValidity::Scripts,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockValidity::Unknown => "unknown",
            BlockValidity::Header => "header",
            BlockValidity::Tree => "tree",
            BlockValidity::Transactions => "transactions",
            BlockValidity::Chain => "chain",
            BlockValidity::Scripts => "scripts",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Invalidity {
    /// The block itself failed validation.
    Failed,
    /// The block descends from a failed block.
    FailedParent,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Valid(BlockValidity),
    /// Terminal. `level` is the validity reached before the failure was found.
    Invalid {
        level: BlockValidity,
        cause: Invalidity,
    },
}

const VALIDITY_MASK: u32 = 0b111;
const HAVE_DATA: u32 = 1 << 3;
const HAVE_UNDO: u32 = 1 << 4;
const FAILED: u32 = 1 << 5;
const FAILED_PARENT: u32 = 1 << 6;
const KNOWN_BITS: u32 = VALIDITY_MASK | HAVE_DATA | HAVE_UNDO | FAILED | FAILED_PARENT;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockStatus {
    verdict: Verdict,
    have_data: bool,
    have_undo: bool,
}

impl Default for BlockStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStatus {
    pub const fn new() -> Self {
        Self {
            verdict: Verdict::Valid(BlockValidity::Unknown),
            have_data: false,
            have_undo: false,
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn validity(&self) -> BlockValidity {
        match self.verdict {
            Verdict::Valid(level) => level,
            Verdict::Invalid { level, .. } => level,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.verdict, Verdict::Invalid { .. })
    }

    pub fn has_failed(&self) -> bool {
        matches!(
            self.verdict,
            Verdict::Invalid {
                cause: Invalidity::Failed,
                ..
            }
        )
    }

    pub fn has_failed_parent(&self) -> bool {
        matches!(
            self.verdict,
            Verdict::Invalid {
                cause: Invalidity::FailedParent,
                ..
            }
        )
    }

    pub fn is_valid(&self, up_to: BlockValidity) -> bool {
        match self.verdict {
            Verdict::Valid(level) => level >= up_to,
            Verdict::Invalid { .. } => false,
        }
    }

    /// Sets the validity level. An invalid status is returned unchanged.
    pub fn with_validity(self, level: BlockValidity) -> Self {
        match self.verdict {
            Verdict::Valid(_) => Self {
                verdict: Verdict::Valid(level),
                ..self
            },
            Verdict::Invalid { .. } => self,
        }
    }

    pub fn with_failed(self) -> Self {
        Self {
            verdict: Verdict::Invalid {
                level: self.validity(),
                cause: Invalidity::Failed,
            },
            ..self
        }
    }

    /// Marks the block as descending from a failed block. A block that failed on its own
    /// keeps that cause.
    pub fn with_failed_parent(self) -> Self {
        if self.has_failed() {
            return self;
        }
        Self {
            verdict: Verdict::Invalid {
                level: self.validity(),
                cause: Invalidity::FailedParent,
            },
            ..self
        }
    }

    pub fn has_data(&self) -> bool {
        self.have_data
    }

    pub fn has_undo(&self) -> bool {
        self.have_undo
    }

    pub fn with_data(self) -> Self {
        Self {
            have_data: true,
            ..self
        }
    }

    pub fn with_undo(self) -> Self {
        Self {
            have_undo: true,
            ..self
        }
    }

    /// Drops both block and undo data, as pruning does.
    pub fn without_data(self) -> Self {
        Self {
            have_data: false,
            have_undo: false,
            ..self
        }
    }

    pub fn to_bits(&self) -> u32 {
        let mut bits = self.validity() as u32;
        if self.have_data {
            bits |= HAVE_DATA;
        }
        if self.have_undo {
            bits |= HAVE_UNDO;
        }
        match self.verdict {
            Verdict::Valid(_) => {}
            Verdict::Invalid {
                cause: Invalidity::Failed,
                ..
            } => bits |= FAILED,
            Verdict::Invalid {
                cause: Invalidity::FailedParent,
                ..
            } => bits |= FAILED_PARENT,
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        if bits & !KNOWN_BITS != 0 {
            return None;
        }
        let level = BlockValidity::from_u8((bits & VALIDITY_MASK) as u8)?;
        let verdict = if bits & FAILED != 0 {
            Verdict::Invalid {
                level,
                cause: Invalidity::Failed,
            }
        } else if bits & FAILED_PARENT != 0 {
            Verdict::Invalid {
                level,
                cause: Invalidity::FailedParent,
            }
        } else {
            Verdict::Valid(level)
        };
        Some(Self {
            verdict,
            have_data: bits & HAVE_DATA != 0,
            have_undo: bits & HAVE_UNDO != 0,
        })
    }
}
