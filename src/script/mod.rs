//! Conditional locking scripts: timelock values, templates, the matching
//! unlocking scripts and a local evaluator to check them.

pub mod interpreter;
pub mod locktime;
pub mod template;
pub mod unlock;


pub use interpreter::{check_finality, verify_input, ChainView, ScriptError, SpendContext};
pub use locktime::{AbsoluteLock, RelativeLock};
pub use template::{BranchPath, ScriptTemplate, SpendBranch};
pub use unlock::UnlockBuilder;

use crate::error::{EngineError, EngineResult};
use bitcoin::script::PushBytesBuf;

/// Wrap bytes for a single script push
pub(crate) fn push_data(bytes: &[u8]) -> EngineResult<PushBytesBuf> {
    PushBytesBuf::try_from(bytes.to_vec())
        .map_err(|e| EngineError::encoding(format!("push of {} bytes: {}", bytes.len(), e)))
}
