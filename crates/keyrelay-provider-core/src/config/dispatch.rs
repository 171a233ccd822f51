use serde::{Deserialize, Serialize};

/// The handful of operations a plugin may be asked to perform. Kept small and
/// flat: the OpenAI-compatible surface is the only inbound shape, so there's
/// no source-protocol axis to dispatch on anymore.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ChatCompletions = 0,
    ChatCompletionsStream = 1,
    ListModels = 2,
    CountTokens = 3,
}

impl OperationKind {
    pub const COUNT: usize = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchRule {
    /// The provider speaks OpenAI chat-completion chunks/bodies natively.
    Native,
    /// The provider's native stream isn't OpenAI-shaped; route it through the
    /// streaming translator before handing chunks back to the caller.
    NativeStreamTranslate,
    Unsupported,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DispatchTable {
    ops: [DispatchRule; OperationKind::COUNT],
}

impl DispatchTable {
    pub const fn new(ops: [DispatchRule; OperationKind::COUNT]) -> Self {
        Self { ops }
    }

    pub fn rule(&self, kind: OperationKind) -> DispatchRule {
        self.ops[kind as usize]
    }

    pub const fn all_native() -> Self {
        Self {
            ops: [DispatchRule::Native; OperationKind::COUNT],
        }
    }

    pub const fn streaming_via_translator() -> Self {
        Self {
            ops: [
                DispatchRule::Native,
                DispatchRule::NativeStreamTranslate,
                DispatchRule::Native,
                DispatchRule::Unsupported,
            ],
        }
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self {
            ops: [DispatchRule::Unsupported; OperationKind::COUNT],
        }
    }
}
