//! Weighted boolean convolution with witness recovery.
//!
//! `c[k] = OR over idx with a[idx] = 1 of b[k - w[idx]]`, together with up to `k`
//! distinct contributing items per output position. Isolation labels come either from a
//! seeded generator or from a small-bias sample built over GF(2^m).

pub mod biased;
pub mod convolution;
pub mod error;
pub mod gf2;
pub mod labels;
pub mod ntt;
pub mod peeling;
pub mod protocol;
pub mod rank_index;
pub mod traits;
pub mod util;
pub mod witness;

pub use convolution::{BitVector, ConvolutionEngine, Instance, KernelStats, WeightMap};
pub use error::{FieldError, ProtocolError, SamplerError, ShapeError, WitnessError};
pub use labels::{BiasedLabels, Randomness, UniformLabels};
pub use peeling::{Order, PeelingRefiner};
pub use witness::{
    Extraction, ExtractionStats, ExtractionStatus, ExtractorConfig, MinWitnesses, WitnessExtractor, WitnessTable,
    extract, ordered_min_witness, prefix_min_witness, sample_witnesses,
};
