#![forbid(unsafe_code)]

pub mod opts;
