pub mod domains;
pub mod ops;
pub mod secrets;
pub mod subscription;
pub mod version;
pub mod xray;
