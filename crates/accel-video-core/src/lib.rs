//! Hardware-accelerated video decode and post-processing pipeline.
//!
//! A [`Decoder`] is the synchronous front door the player drives:
//! [`Decoder::decode`] submits encoded access units to the hardware and
//! [`Decoder::get_picture`] collects presentable pictures. Between the
//! two, an output actor and a mixer actor run on their own threads,
//! deinterlacing and post-processing decoded surfaces and recycling GPU
//! memory as the consumer lets pictures go.
//!
//! The hardware itself is reached through the [`vendor::VendorDevice`]
//! trait, so the pipeline carries no driver bindings of its own.

pub mod decoder;
pub mod mailbox;
pub mod mixer;
pub mod output;
pub mod picture;
pub mod surfaces;
pub mod vendor;

pub use decoder::{AccessUnit, CodecControl, DecodeResult, Decoder, OpenError, PictureResult};
pub use picture::{
    CodecParams, CropRect, InterlaceMethod, PictureFlags, PostProcSettings, PostProcValues,
    RenderPicture,
};
pub use surfaces::{BufferStats, SurfacePool, SurfaceState};
pub use vendor::{ChromaFormat, CodecProfile, VendorDevice, VendorError, VendorErrorKind};
