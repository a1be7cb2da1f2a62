pub mod init;
pub mod result;
pub mod run;
pub mod status;
pub mod submit;
