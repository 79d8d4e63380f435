//! Job bodies, one module per job kind.

mod attributes;
mod create;
mod deep_count;
mod listdir;
mod mkdir;
mod transfer;
mod unlink;

pub use attributes::AttributeReport;
pub use create::CreateReport;
pub use deep_count::DeepCountReport;
pub use listdir::{ListDirReport, ListEntry};
pub use mkdir::MkdirReport;
pub use transfer::{TransferReport, TransferredItem};
pub use unlink::UnlinkReport;

use ferry_core::FileOpError;

use crate::job::{JobContext, JobOutcome};
use crate::request::JobRequest;

/// Run a validated request on the current worker thread.
pub(crate) fn run(request: JobRequest, ctx: &mut JobContext) -> Result<JobOutcome, FileOpError> {
    match request {
        JobRequest::Transfer(r) => transfer::run(r, ctx).map(JobOutcome::Transfer),
        JobRequest::Mkdir(r) => mkdir::run(r, ctx).map(JobOutcome::Mkdir),
        JobRequest::Unlink(r) => unlink::run(r, ctx).map(JobOutcome::Unlink),
        JobRequest::Chmod(r) => attributes::run_chmod(r, ctx).map(JobOutcome::Chmod),
        JobRequest::Chown(r) => attributes::run_chown(r, ctx).map(JobOutcome::Chown),
        JobRequest::Create(r) => create::run(r, ctx).map(JobOutcome::Create),
        JobRequest::DeepCount(r) => deep_count::run(r, ctx).map(JobOutcome::DeepCount),
        JobRequest::ListDir(r) => listdir::run(r, ctx).map(JobOutcome::ListDir),
    }
}
