pub mod decompose;
pub mod run;
