//! Additive mixing of audio read from several media streams
//!
//! Samples are treated as signed 8-bit values. The mix of N frames is the
//! exact sum clamped once to the sample range, which makes the result
//! independent of the order the frames are given in. Frames shorter than
//! the longest one contribute zero past their end.

use bytes::Bytes;

/// Mix any number of frames into one
pub fn mix_frames(frames: &[Bytes]) -> Bytes {
    match frames {
        [] => Bytes::new(),
        [single] => single.clone(),
        _ => {
            let length = frames.iter().map(Bytes::len).max().unwrap_or(0);
            let mut acc = vec![0i32; length];
            for frame in frames {
                for (slot, sample) in acc.iter_mut().zip(frame.iter()) {
                    *slot += *sample as i8 as i32;
                }
            }
            acc.into_iter()
                .map(|sum| sum.clamp(i8::MIN as i32, i8::MAX as i32) as i8 as u8)
                .collect::<Vec<u8>>()
                .into()
        }
    }
}

/// Saturating sum of two samples
pub fn saturating_add(a: u8, b: u8) -> u8 {
    (a as i8).saturating_add(b as i8) as u8
}

/// A frame of `length` copies of the silence byte
pub fn silence(length: usize, silence_byte: u8) -> Bytes {
    Bytes::from(vec![silence_byte; length])
}
