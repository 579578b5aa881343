mod blob;
mod finding;
mod hash;
mod job;
mod object;

pub use blob::{BlobRecord, Category, Change, Classification, ContentKind, Provenance};
pub use finding::{BackendMatch, CoverageGap, PartialFailure, ScanFinding};
pub use hash::ObjectHash;
pub use job::{AnalyzeJob, JobId, JobState, Lane, ParseRepoIdError, RepoId, RepoJob};
pub use object::{CommitNode, ObjectKind, TreeEntry};
