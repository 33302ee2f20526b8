//! Opus frame codec
//!
//! Clients send one Opus packet per WebSocket binary message: 60 ms of
//! 16 kHz mono audio, i.e. 960 samples per frame. Each connection owns its
//! own decoder; Opus decoder state is stream-local and must not be shared.

use crate::error::GatewayError;

pub const SAMPLE_RATE: u32 = 16_000;
pub const FRAME_SAMPLES: usize = 960;

/// Stateful Opus decoder for one client's audio stream.
pub struct OpusFrameDecoder {
    decoder: opus::Decoder,
}

impl OpusFrameDecoder {
    pub fn new() -> Result<Self, GatewayError> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .map_err(|e| GatewayError::Internal(format!("opus decoder init: {}", e)))?;
        Ok(Self { decoder })
    }

    /// Decode one Opus packet into 960 PCM samples. Malformed packets are
    /// reported as `Decode` so the caller can drop the frame and continue.
    pub fn decode(&mut self, frame: &[u8]) -> Result<Vec<i16>, GatewayError> {
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        let decoded = self
            .decoder
            .decode(frame, &mut pcm, false)
            .map_err(|e| GatewayError::Decode(format!("opus: {}", e)))?;
        pcm.truncate(decoded);
        Ok(pcm)
    }
}

/// Pack PCM samples as little-endian bytes for upstream transport.
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_round_trip() {
        let mut encoder =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
                .unwrap();
        let input = vec![0i16; FRAME_SAMPLES];
        let packet = encoder.encode_vec(&input, 4000).unwrap();

        let mut decoder = OpusFrameDecoder::new().unwrap();
        let pcm = decoder.decode(&packet).unwrap();
        assert_eq!(pcm.len(), FRAME_SAMPLES);
    }

    #[test]
    fn test_pcm_to_bytes_little_endian() {
        let bytes = pcm_to_bytes(&[0x0102, -1]);
        assert_eq!(bytes, vec![0x02, 0x01, 0xff, 0xff]);
    }
}
