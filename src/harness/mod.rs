pub mod coordinator;
pub mod types;

pub use coordinator::{Collaborators, TestRunCoordinator, names_from_url};
pub use types::{
    BaselineSelection, BatchInfo, HarnessError, HarnessResult, MatchLevel, TestParameters,
    TestReport,
};
