//! The line protocol on stdin/stdout.
//!
//! Input is five lines: `n [k]`, then `a`, `b`, `w` and `order`, each with exactly `n`
//! tokens. Output is one line per position `0..full_len`.

use std::io::{BufRead, Write};
use std::time::Duration;

use crate::convolution::{BitVector, Instance, WeightMap};
use crate::error::{ProtocolError, ShapeError};
use crate::peeling::Order;
use crate::witness::{ExtractionStats, WitnessTable};

#[derive(Debug, Clone)]
pub struct ProtocolInput {
    pub instance: Instance,
    pub order: Order,
    /// Witnesses requested per position, 1 when line 1 only holds `n`.
    pub witnesses: usize,
}

struct Lines<R> {
    inner: std::io::Lines<R>,
    line: usize,
}

impl<R: BufRead> Lines<R> {
    fn next_tokens(&mut self, what: &'static str) -> Result<(usize, Vec<String>), ProtocolError> {
        self.line += 1;
        match self.inner.next() {
            Some(text) => Ok((self.line, text?.split_whitespace().map(str::to_owned).collect())),
            None => Err(ProtocolError::MissingLine { line: self.line, what }),
        }
    }
}

fn parse_u64(line: usize, token: &str) -> Result<u64, ProtocolError> {
    token.parse().map_err(|_| ProtocolError::Parse { line, token: token.to_owned() })
}

fn parse_row(
    lines: &mut Lines<impl BufRead>,
    name: &'static str,
    n: usize,
) -> Result<Vec<u64>, ProtocolError> {
    let (line, tokens) = lines.next_tokens(name)?;
    if tokens.len() != n {
        return Err(ShapeError::LengthMismatch { name, got: tokens.len(), expected: n }.into());
    }
    tokens.iter().map(|t| parse_u64(line, t)).collect()
}

fn to_bits(name: &'static str, values: &[u64]) -> Result<BitVector, ShapeError> {
    let mut bits = BitVector::with_capacity(values.len());
    for (index, &value) in values.iter().enumerate() {
        if value > 1 {
            return Err(ShapeError::NotABit { name, index, value });
        }
        bits.push(value == 1);
    }
    Ok(bits)
}

pub fn parse_input(reader: impl BufRead) -> Result<ProtocolInput, ProtocolError> {
    let mut lines = Lines { inner: reader.lines(), line: 0 };

    let (line, header) = lines.next_tokens("n k")?;
    let (n, witnesses) = match header.as_slice() {
        [n] => (parse_u64(line, n)?, 1),
        [n, k] => (parse_u64(line, n)?, parse_u64(line, k)?),
        [] => return Err(ProtocolError::MissingLine { line, what: "n k" }),
        _ => return Err(ProtocolError::TrailingInput { line }),
    };
    if witnesses == 0 {
        return Err(ShapeError::ZeroMultiplicity.into());
    }
    let n = n as usize;

    let a = to_bits("a", &parse_row(&mut lines, "a", n)?)?;
    let b = to_bits("b", &parse_row(&mut lines, "b", n)?)?;
    let w = parse_row(&mut lines, "w", n)?;
    if let Some((index, &weight)) = w.iter().enumerate().find(|&(_, &x)| x >= n as u64) {
        return Err(ShapeError::WeightOutOfRange { index, weight, bound: n as u64 }.into());
    }
    let perm = parse_row(&mut lines, "order", n)?;
    let order = Order::new(perm.into_iter().map(|v| v as usize).collect())?;

    while let Some(rest) = lines.inner.next() {
        lines.line += 1;
        if !rest?.trim().is_empty() {
            return Err(ProtocolError::TrailingInput { line: lines.line });
        }
    }

    let instance = Instance::new(a, b, WeightMap::new(w))?;
    Ok(ProtocolInput { instance, order, witnesses: witnesses as usize })
}

/// `count idx...` per position; unresolved positions carry a leading `?`.
pub fn write_k_witness(out: &mut impl Write, table: &WitnessTable) -> std::io::Result<()> {
    for k in 0..table.len() {
        let ws = table.witnesses(k);
        if table.is_unresolved(k) {
            write!(out, "?")?;
        }
        write!(out, "{}", ws.len())?;
        for idx in ws {
            write!(out, " {idx}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// One witness index per position, `-1` where there is none.
pub fn write_min_witness(out: &mut impl Write, witnesses: &[Option<usize>]) -> std::io::Result<()> {
    for w in witnesses {
        match w {
            Some(idx) => writeln!(out, "{idx}")?,
            None => writeln!(out, "-1")?,
        }
    }
    Ok(())
}

/// Timing and work counters for the benchmarking tooling. Not part of the output contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub feasibility_time: Duration,
    pub max_live_support: usize,
    pub direct_blocks: u64,
    pub dense_blocks: u64,
    pub rounds: u32,
    pub collisions: u64,
    pub unresolved: usize,
    pub total_time: Duration,
}

impl Diagnostics {
    pub fn from_extraction(stats: &ExtractionStats, unresolved: usize) -> Self {
        Self {
            feasibility_time: stats.feasibility_time,
            max_live_support: stats.max_live_support,
            direct_blocks: stats.direct_blocks,
            dense_blocks: stats.dense_blocks,
            rounds: stats.rounds,
            collisions: stats.collisions,
            unresolved,
            total_time: stats.total_time,
        }
    }

    /// `<Label>: <value> <unit>` lines.
    pub fn lines(&self) -> Vec<String> {
        let ms = |d: Duration| d.as_secs_f64() * 1e3;
        vec![
            format!("Feasibility time: {:.3} ms", ms(self.feasibility_time)),
            format!("Max live support: {} items", self.max_live_support),
            format!("Direct blocks: {} blocks", self.direct_blocks),
            format!("Dense blocks: {} blocks", self.dense_blocks),
            format!("Rounds: {} rounds", self.rounds),
            format!("Label collisions: {} positions", self.collisions),
            format!("Unresolved positions: {} positions", self.unresolved),
            format!("Total time: {:.3} ms", ms(self.total_time)),
        ]
    }

    pub fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        for line in self.lines() {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }
}
