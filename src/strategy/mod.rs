pub mod terminate_then_verify;
pub mod verify_then_terminate;

pub use terminate_then_verify::TerminateThenVerify;
pub use verify_then_terminate::VerifyThenTerminate;
