/*
 * gitmirror/api - defines the gitmirror CRDs shared by the unit daemon
 * (mirrord) and the command line client (mirrorctl)
 */

pub mod gitmirror;
pub use gitmirror::GitMirror;
pub use gitmirror::GitMirrorSpec;

pub mod mirrorunit;
pub use mirrorunit::MirrorUnit;
pub use mirrorunit::MirrorUnitState;
pub use mirrorunit::MirrorUnitStatus;
pub use mirrorunit::SyncRecord;
pub use mirrorunit::SYNC_NOW_ANNOTATION;
