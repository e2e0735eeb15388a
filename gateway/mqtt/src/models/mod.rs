pub mod sensor;
pub mod status;
pub mod topics;
pub mod types;
