pub mod run;

pub use run::{Components, handle_run};
