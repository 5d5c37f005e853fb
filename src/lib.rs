#![allow(warnings)]
#![cfg_attr(feature = "nightly", feature(backtrace))]

pub(crate) mod deps {
    pub use bitflags;
    pub use derive_more;
    pub use lazy_static;
    pub use log;
    pub use serde;
    pub use serde_json;
    pub use thiserror;
}

mod io;
mod wait;

pub mod bitmap;
pub mod config;
pub mod consts;
pub mod counter;
pub mod countermap;
pub mod daemon;
pub mod error;
pub mod host;
pub mod pagepool;
pub mod storage;

pub use bitmap::{Bitmap, BitmapConfig, BitmapFlags};
pub use error::{BitmapError, Result};
