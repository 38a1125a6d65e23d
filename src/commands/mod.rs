pub mod check;
pub mod init;
pub mod probe;
pub mod run;
