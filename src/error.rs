use thiserror::Error;

/// Malformed inputs, detected before any convolution or round runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("{name} has {got} entries, expected {expected}")]
    LengthMismatch {
        name: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("order is not a permutation of 0..{len}: value {value} at slot {slot}")]
    NotPermutation { len: usize, slot: usize, value: usize },
    #[error("weight {weight} of item {index} is out of range (must be below {bound})")]
    WeightOutOfRange { index: usize, weight: u64, bound: u64 },
    #[error("{name}[{index}] = {value} is not a bit")]
    NotABit {
        name: &'static str,
        index: usize,
        value: u64,
    },
    #[error("witness multiplicity must be at least 1")]
    ZeroMultiplicity,
    #[error("coefficient vector has {got} entries, expected one per item ({expected})")]
    CoefficientCount { got: usize, expected: usize },
    #[error("output range {lo}..{hi} is not inside 0..{len}")]
    RangeOutOfBounds { lo: usize, hi: usize, len: usize },
    #[error("transform length {len} exceeds the supported maximum {limit}")]
    TooLarge { len: usize, limit: usize },
    #[error("coefficient bound {bound} does not fit in 64 bits")]
    CoefficientOverflow { bound: u128 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    #[error("field degree {degree} is outside 1..={max}")]
    DegreeOutOfRange { degree: u32, max: u32 },
    /// Irreducibles exist for every degree, so this is an invariant violation.
    #[error("no irreducible polynomial of degree {degree} found")]
    NoIrreducible { degree: u32 },
    #[error("{modulus:#b} is not irreducible")]
    Reducible { modulus: u64 },
    #[error("{value:#x} is not an element of GF(2^{degree})")]
    NotAnElement { value: u64, degree: u32 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SamplerError {
    #[error("sample length must be at least 1")]
    EmptyLength,
    #[error("bias {0} is outside (0, 1]")]
    InvalidBias(f64),
    #[error("x must be a nonzero field element")]
    ZeroGenerator,
    #[error(transparent)]
    Field(#[from] FieldError),
}

#[derive(Debug, Error)]
pub enum WitnessError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error("witness table encoding failed: {0}")]
    Persist(#[from] bincode::Error),
    #[error("corrupt witness table: {0}")]
    Corrupt(&'static str),
}

impl From<FieldError> for WitnessError {
    fn from(e: FieldError) -> Self {
        WitnessError::Sampler(SamplerError::Field(e))
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing input line {line} ({what})")]
    MissingLine { line: usize, what: &'static str },
    #[error("line {line}: cannot parse {token:?} as an integer")]
    Parse { line: usize, token: String },
    #[error("line {line}: unexpected trailing input")]
    TrailingInput { line: usize },
    #[error(transparent)]
    Shape(#[from] ShapeError),
}
