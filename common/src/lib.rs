#![no_std]

extern crate alloc;

pub mod coin;
pub mod comm;
pub mod constants;
pub mod error;
pub mod message;
pub mod token;
