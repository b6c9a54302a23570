#[macro_use]
extern crate bitfield;

pub mod assembler;
pub mod config;
pub mod controller;
pub mod descriptor;
pub mod enumerator;
pub mod gadget;
pub mod irq;
pub mod setup;
pub mod statistics;
pub mod usb;
pub mod vec_map;

#[cfg(any(test, feature="fuzzer"))]
pub mod testing;
