//! Fixed sinusoidal positional encoding.
//!
//! The table is added to, or concatenated with, the token stream. Separate
//! tables exist for training-length and test-length sequences.

use candle_core::{D, Device, Result, Tensor};

use super::config::TransformerConfig;

/// Build a `(rows, size)` sinusoidal table.
///
/// Even columns hold `sin(p * r_i)`, odd columns `cos(p * r_i)` with
/// `r_i = exp(-2i * ln(10000) / size)`. With `flip` the row order is reversed
/// so the last token gets position 0.
///
/// # Errors
/// Returns an error if tensor creation fails.
#[allow(clippy::cast_precision_loss)]
pub fn sinusoidal_table(rows: usize, size: usize, flip: bool, device: &Device) -> Result<Tensor> {
    let mut data = vec![0.0f32; rows * size];
    let log_base = 10000f64.ln();

    for p in 0..rows {
        let row = if flip { rows - 1 - p } else { p };
        for i in (0..size).step_by(2) {
            let rate = (-(i as f64) * log_base / size as f64).exp();
            let angle = p as f64 * rate;
            data[row * size + i] = angle.sin() as f32;
            if i + 1 < size {
                data[row * size + i + 1] = angle.cos() as f32;
            }
        }
    }

    Tensor::from_vec(data, (rows, size), device)
}

/// Positional encoding applied ahead of the first block.
pub struct PositionalEncoding {
    /// Table for training-length sequences
    train: Tensor,
    /// Table for test-length sequences
    test: Tensor,
    concat: bool,
    zero: bool,
}

impl PositionalEncoding {
    /// Build both tables from the configuration.
    ///
    /// # Errors
    /// Returns an error if tensor creation fails.
    pub fn new(config: &TransformerConfig, device: &Device) -> Result<Self> {
        let train = sinusoidal_table(
            config.in_context_length,
            config.pe_size,
            config.flip_pe,
            device,
        )?;
        let test = sinusoidal_table(
            config.in_context_length_test,
            config.pe_size,
            config.flip_pe,
            device,
        )?;
        Ok(Self {
            train,
            test,
            concat: config.concat_pe,
            zero: config.zero_embeddings,
        })
    }

    /// Table rows used for a sequence of `seq_len` tokens.
    ///
    /// # Errors
    /// Returns an error if the sequence is longer than the table.
    pub fn rows(&self, seq_len: usize, predict_test: bool) -> Result<Tensor> {
        let table = if predict_test { &self.test } else { &self.train };
        let (rows, _) = table.dims2()?;
        if seq_len > rows {
            return Err(candle_core::Error::Msg(format!(
                "Sequence length {seq_len} exceeds positional table length {rows}"
            )));
        }
        let pe = table.narrow(0, 0, seq_len)?;
        if self.zero { pe.zeros_like() } else { Ok(pe) }
    }

    /// Apply the encoding to `h` of shape (batch, seq_len, width).
    ///
    /// # Errors
    /// Returns an error if the sequence is too long or shapes mismatch.
    pub fn forward(&self, h: &Tensor, predict_test: bool) -> Result<Tensor> {
        let (b, t, _) = h.dims3()?;
        let pe = self.rows(t, predict_test)?.to_dtype(h.dtype())?.unsqueeze(0)?;

        if self.concat {
            let size = pe.dim(D::Minus1)?;
            let pe = pe.broadcast_as((b, t, size))?;
            Tensor::cat(&[h, &pe], D::Minus1)
        } else {
            h.broadcast_add(&pe)
        }
    }
}
