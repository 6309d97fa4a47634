//! Handwriting recognition
//!
//! Turns one cropped line image into text. The production backend is a TrOCR
//! encoder/decoder pair exported to ONNX: the encoder runs once per line and
//! the decoder is called greedily, one token at a time.

use anyhow::{anyhow, bail, Context, Result};
use image::{imageops::FilterType, RgbImage};
use ndarray::{Array2, Array3, Array4};
use ort::value::Value;
use parking_lot::Mutex;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::models::{ModelFile, ModelManager, OnnxSession};
use crate::config::RecognizerSettings;
use crate::errors::{RecognitionError, RecognitionResult};

/// Per-channel normalization used by the TrOCR image processor
const PIXEL_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const PIXEL_STD: [f32; 3] = [0.5, 0.5, 0.5];

const ENCODER_INPUT: &str = "pixel_values";
const DECODER_IDS_INPUT: &str = "input_ids";
const DECODER_HIDDEN_INPUT: &str = "encoder_hidden_states";

/// Fallback id of `</s>` in the TrOCR vocabulary
const DEFAULT_EOS_ID: u32 = 2;

/// Anything that can read one line of handwriting
pub trait TextRecognizer: Send + Sync {
    /// Recognize the text in a single line crop
    fn recognize(&self, line: &RgbImage) -> RecognitionResult<String>;
}

/// TrOCR recognizer backed by ONNX Runtime
pub struct TrOcrRecognizer {
    encoder: Mutex<OnnxSession>,
    decoder: Mutex<OnnxSession>,
    tokenizer: Tokenizer,
    image_size: u32,
    max_new_tokens: usize,
    decoder_start_id: i64,
    eos_id: i64,
}

impl TrOcrRecognizer {
    /// Load the model, downloading missing files first
    pub fn load(settings: &RecognizerSettings, manager: &ModelManager) -> Result<Self> {
        if settings.languages.iter().any(|lang| lang != "en") {
            warn!(
                "Languages {:?} requested; {} only reads English handwriting",
                settings.languages, settings.model_id
            );
        }

        manager
            .ensure_all_models()
            .context("Recognition model files are not available")?;

        let encoder = OnnxSession::new(&manager.model_path(ModelFile::Encoder), settings.device)?;
        let decoder = OnnxSession::new(&manager.model_path(ModelFile::Decoder), settings.device)?;

        let expected_inputs = [
            (&encoder, ENCODER_INPUT),
            (&decoder, DECODER_IDS_INPUT),
            (&decoder, DECODER_HIDDEN_INPUT),
        ];
        for (session, name) in expected_inputs {
            if !session.has_input(name) {
                bail!(
                    "{} export lacks input {:?} (has {:?})",
                    settings.model_id,
                    name,
                    session.input_names()
                );
            }
        }

        let tokenizer_path = manager.model_path(ModelFile::Tokenizer);
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer {:?}: {}", tokenizer_path, e))?;

        // TrOCR starts decoding from `</s>` and stops when it reappears
        let eos_id = tokenizer.token_to_id("</s>").unwrap_or(DEFAULT_EOS_ID) as i64;

        info!(
            "Loaded {} (encoder outputs {:?}, decoder outputs {:?})",
            settings.model_id,
            encoder.output_names(),
            decoder.output_names()
        );

        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            tokenizer,
            image_size: settings.image_size,
            max_new_tokens: settings.max_new_tokens,
            decoder_start_id: eos_id,
            eos_id,
        })
    }

    /// Run the encoder on one preprocessed line
    fn encode(&self, pixels: Array4<f32>) -> RecognitionResult<Array3<f32>> {
        let input = Value::from_array(pixels)?;

        let mut encoder = self.encoder.lock();
        let outputs = encoder
            .session_mut()
            .run(ort::inputs![ENCODER_INPUT => input])?;

        let (shape, data) = outputs["last_hidden_state"].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        if dims.len() != 3 {
            return Err(RecognitionError::ModelOutput(format!(
                "encoder hidden state has shape {:?}",
                dims
            )));
        }

        Array3::from_shape_vec((dims[0], dims[1], dims[2]), data.to_vec())
            .map_err(|e| RecognitionError::ModelOutput(e.to_string()))
    }

    /// Greedy decoding from the start token until `</s>` or the token budget
    fn decode(&self, hidden: &Array3<f32>) -> RecognitionResult<Vec<u32>> {
        let mut ids: Vec<i64> = vec![self.decoder_start_id];
        let mut decoder = self.decoder.lock();

        for _ in 0..self.max_new_tokens {
            let input_ids = Array2::from_shape_vec((1, ids.len()), ids.clone())
                .map_err(|e| RecognitionError::ModelOutput(e.to_string()))?;

            let outputs = decoder.session_mut().run(ort::inputs![
                DECODER_IDS_INPUT => Value::from_array(input_ids)?,
                DECODER_HIDDEN_INPUT => Value::from_array(hidden.clone())?
            ])?;

            let (shape, logits) = outputs["logits"].try_extract_tensor::<f32>()?;
            let vocab = shape.last().copied().unwrap_or(0) as usize;
            if vocab == 0 || logits.len() < vocab {
                return Err(RecognitionError::ModelOutput(format!(
                    "decoder logits have shape {:?}",
                    shape.iter().collect::<Vec<_>>()
                )));
            }

            let last_step = &logits[logits.len() - vocab..];
            let next = argmax(last_step) as i64;
            if next == self.eos_id {
                break;
            }
            ids.push(next);
        }

        Ok(ids.into_iter().skip(1).map(|id| id as u32).collect())
    }
}

impl TextRecognizer for TrOcrRecognizer {
    fn recognize(&self, line: &RgbImage) -> RecognitionResult<String> {
        if line.width() == 0 || line.height() == 0 {
            return Err(RecognitionError::EmptyLine);
        }

        let start = Instant::now();
        let pixels = pixel_values(line, self.image_size);
        let hidden = self.encode(pixels)?;
        let tokens = self.decode(&hidden)?;

        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| RecognitionError::Tokenizer(e.to_string()))?;
        let text = text.trim().to_string();

        debug!(
            "Recognized {} tokens in {:?}: {:?}",
            tokens.len(),
            start.elapsed(),
            text
        );
        Ok(text)
    }
}

/// Resize to the square model input, scale to [0, 1], normalize, lay out as NCHW
pub fn pixel_values(image: &RgbImage, size: u32) -> Array4<f32> {
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    let size = size as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel.0[c] as f32 / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (value - PIXEL_MEAN[c]) / PIXEL_STD[c];
        }
    }
    tensor
}

/// Index of the largest value (first one on ties)
fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best_i, best_v), (i, &v)| {
            if v > best_v {
                (i, v)
            } else {
                (best_i, best_v)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_pixel_values_shape_and_range() {
        let line = RgbImage::from_fn(120, 30, |x, _| {
            if x < 60 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) }
        });

        let tensor = pixel_values(&line, 32);
        assert_eq!(tensor.shape(), &[1, 3, 32, 32]);

        // Black maps to -1, white to +1
        assert!((tensor[[0, 0, 10, 0]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 10, 31]] - 1.0).abs() < 1e-6);
        assert!(tensor.iter().all(|&v| (-1.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_pixel_values_channel_order() {
        let line = RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]));
        let tensor = pixel_values(&line, 4);

        assert!((tensor[[0, 0, 1, 1]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 1, 1]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 1, 1]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 3.0, -2.0, 3.0]), 1);
        assert_eq!(argmax(&[-5.0]), 0);
    }
}
