//! # FC Link Library
//!
//! Talk MSP v2 to an INAV flight controller over USB serial and decode the
//! blackbox logs it records.
//!
//! The link side finds the flight controller, exchanges MSP requests with
//! bounded retries, downloads the dataflash image and drives the text CLI.
//! The decode side turns that image into frames and splits them into
//! flights.

pub mod blackbox;
pub mod config;
pub mod error;
pub mod msp;
pub mod serial;
pub mod session;
