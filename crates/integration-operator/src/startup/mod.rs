mod crds;

pub use crds::{all_crds, ensure_crds, CrdDef};
