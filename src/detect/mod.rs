mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{ReplayBackend, StubBackend};
pub use registry::{BackendFactory, BackendRegistry, BackendRequest};
pub use result::{validate_label, ClassMap, Detection, ObjectClass};
