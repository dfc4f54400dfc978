//! Sample data and the format conversion applied when a waveform enters the
//! cache: integer upsampling (1x/2x/4x) followed by 8->16 bit widening.
//!
//! The resampling here is deliberately the naive linear-interpolation
//! algorithm the original engine shipped, aliasing artifacts and all — see
//! `SPEC_FULL.md` SS9. It is not a bug to be fixed; a higher-quality
//! resampler is out of scope.

/// An immutable block of PCM audio plus the format it was produced in.
#[derive(Debug, Clone)]
pub struct Sample {
    pub effect_id: i32,
    pub group: i32,
    pub bytes_per_sample: u8,
    pub rate_hz: u32,
    pub num_samples: u32,
    pub data: std::sync::Arc<[u8]>,
}

impl Sample {
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn milliseconds(&self) -> u32 {
        if self.rate_hz == 0 {
            return 0;
        }
        ((self.num_samples as u64 * 1000) / self.rate_hz as u64) as u32
    }
}

/// Upsample factor applied at cache-insertion time. Only integer multiples
/// are supported, matching the original engine's `resample()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsampleFactor {
    X1,
    X2,
    X4,
}

impl UpsampleFactor {
    pub fn as_u32(self) -> u32 {
        match self {
            UpsampleFactor::X1 => 1,
            UpsampleFactor::X2 => 2,
            UpsampleFactor::X4 => 4,
        }
    }
}

fn u8_to_s16(b: u8) -> i16 {
    ((b as i16 - 0x80) as i32 * 256) as i16
}

/// Converts raw `(bytes_per_sample_in, rate_in)` PCM into `num_samples_in *
/// factor` samples at `bytes_per_sample_out` width. When `factor == X1` and
/// the input width already matches the output width, this is a pure copy.
///
/// `bytes_per_sample_out` must be 1 or 2; narrowing 16->8 is never
/// performed (callers never request it).
pub fn resample(
    input: &[u8],
    bytes_per_sample_in: u8,
    num_samples_in: u32,
    factor: UpsampleFactor,
    bytes_per_sample_out: u8,
) -> Vec<u8> {
    assert!(bytes_per_sample_out == 1 || bytes_per_sample_out == 2);
    assert!(bytes_per_sample_in == 1 || bytes_per_sample_in == 2);

    if factor == UpsampleFactor::X1 && bytes_per_sample_in == bytes_per_sample_out {
        return input.to_vec();
    }

    // Decode to a uniform i16 buffer first; this also performs the width
    // widening step of SS4.1 point 2.
    let samples_in: Vec<i16> = if bytes_per_sample_in == 1 {
        input[..num_samples_in as usize]
            .iter()
            .map(|&b| u8_to_s16(b))
            .collect()
    } else {
        input[..(num_samples_in as usize * 2)]
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    };

    let upsampled: Vec<i16> = match factor {
        UpsampleFactor::X1 => samples_in,
        UpsampleFactor::X2 => upsample_linear(&samples_in, 2),
        UpsampleFactor::X4 => upsample_linear(&samples_in, 4),
    };

    if bytes_per_sample_out == 2 {
        upsampled.iter().flat_map(|s| s.to_le_bytes()).collect()
    } else {
        // 16->8 narrowing is never requested by this crate, but keep the
        // conversion total for completeness of the function's contract.
        upsampled.iter().map(|&s| ((s >> 8) as u8).wrapping_add(0x80)).collect()
    }
}

/// Linear interpolation upsample by an integer `factor` (2 or 4). The final
/// `factor` output samples replicate the last input sample, matching the
/// original engine's edge behavior (there is no sample past the end to
/// interpolate towards).
fn upsample_linear(input: &[i16], factor: u32) -> Vec<i16> {
    if input.is_empty() {
        return Vec::new();
    }
    let n = input.len();
    let mut out = Vec::with_capacity(n * factor as usize);

    for i in 0..n {
        let a = input[i] as i32;
        if i + 1 < n {
            let b = input[i + 1] as i32;
            for step in 0..factor {
                let t = step as i32;
                let v = a + (b - a) * t / factor as i32;
                out.push(v as i16);
            }
        } else {
            // Last input sample: replicate rather than interpolate forward.
            for _ in 0..factor {
                out.push(a as i16);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_one_matching_width_is_memcpy() {
        let input = vec![1u8, 2, 3, 4, 5];
        let out = resample(&input, 1, 5, UpsampleFactor::X1, 1);
        assert_eq!(out, input);
    }

    #[test]
    fn u8_to_s16_widening_is_exact() {
        assert_eq!(u8_to_s16(0x80), 0);
        assert_eq!(u8_to_s16(0x00), -32768);
        assert_eq!(u8_to_s16(0xFF), 32512);
    }

    #[test]
    fn two_x_upsample_doubles_length_and_replicates_tail() {
        let input = vec![10u8, 20, 30];
        let out = resample(&input, 1, 3, UpsampleFactor::X2, 2);
        assert_eq!(out.len(), 3 * 2 * 2); // samples * factor * bytes_per_sample
        let samples: Vec<i16> = out
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples.len(), 6);
        let last = u8_to_s16(30);
        assert_eq!(samples[4], last);
        assert_eq!(samples[5], last);
    }

    #[test]
    fn four_x_upsample_quadruples_length() {
        let input = vec![0u8, 128, 255];
        let out = resample(&input, 1, 3, UpsampleFactor::X4, 2);
        assert_eq!(out.len(), 3 * 4 * 2);
    }

    #[test]
    fn milliseconds_computed_from_rate() {
        let sample = Sample {
            effect_id: 1,
            group: 0,
            bytes_per_sample: 2,
            rate_hz: 11025,
            num_samples: 11025,
            data: std::sync::Arc::from(vec![0u8; 22050]),
        };
        assert_eq!(sample.milliseconds(), 1000);
    }
}
