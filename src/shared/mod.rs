pub mod fs_atomic;
pub mod ids;
pub mod keyed_lock;
pub mod logging;
pub mod subprocess;
pub mod text;
