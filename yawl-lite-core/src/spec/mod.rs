pub mod model;
pub mod verifier;

pub use model::{
    ConditionKind, ConditionSpec, Decomposition, FlowSpec, NetBuilder, NetElement, NetSpec,
    Specification, TaskSpec,
};
pub use verifier::{verify, verify_or_err, VerifyError, VerifyReport};
