#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod form_utils;
pub mod urlencoded;
