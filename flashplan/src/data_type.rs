use std::fmt;

use bytemuck::{Pod, Zeroable};
use half::{bf16, f16};
use num_traits::{NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Copy,
    Clone,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    // Floating point
    BF16,
    F16,
    F8E4M3,
    F32,
    // Integers (offsets, page tables, semaphores)
    I32,
}

impl DataType {
    pub const fn size_in_bits(&self) -> usize {
        match self {
            DataType::BF16 => 16,
            DataType::F16 => 16,
            DataType::F8E4M3 => 8,
            DataType::F32 => 32,
            DataType::I32 => 32,
        }
    }

    pub const fn size_in_bytes(&self) -> usize {
        self.size_in_bits().div_ceil(8)
    }

    pub fn is_float8(&self) -> bool {
        matches!(self, DataType::F8E4M3)
    }

    pub fn is_half(&self) -> bool {
        matches!(self, DataType::F16 | DataType::BF16)
    }
}

impl fmt::Display for DataType {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            DataType::BF16 => "bf16",
            DataType::F16 => "f16",
            DataType::F8E4M3 => "f8e4m3",
            DataType::F32 => "f32",
            DataType::I32 => "i32",
        };
        f.write_str(name)
    }
}

/// 8-bit float with 4 exponent bits (bias 7) and 3 mantissa bits.
///
/// The encoding has no infinities: `0x7f`/`0xff` are NaN and the largest
/// finite magnitude is 448. Conversion from wider types saturates.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct F8E4M3(u8);

impl F8E4M3 {
    pub const MAX: f32 = 448.0;
    const NAN_BITS: u8 = 0x7f;
    const MAX_BITS: u8 = 0x7e;
    const MANTISSA_BITS: i32 = 3;
    const EXPONENT_BIAS: i32 = 7;
    const MIN_NORMAL_EXP: i32 = -6;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn to_bits(self) -> u8 {
        self.0
    }

    pub fn is_nan(self) -> bool {
        self.0 & 0x7f == Self::NAN_BITS
    }

    pub fn from_f32(value: f32) -> Self {
        if value.is_nan() {
            return Self(Self::NAN_BITS);
        }
        let sign = if value.is_sign_negative() {
            0x80
        } else {
            0x00
        };
        let magnitude = value.abs();
        if magnitude >= Self::MAX {
            return Self(sign | Self::MAX_BITS);
        }

        let min_normal = 2f32.powi(Self::MIN_NORMAL_EXP);
        if magnitude < min_normal {
            // Subnormal step is 2^-9; a rounded-up 8 lands exactly on the
            // smallest normal encoding.
            let step = 2f32.powi(Self::MIN_NORMAL_EXP - Self::MANTISSA_BITS);
            let quanta = (magnitude / step).round_ties_even() as u8;
            return Self(sign | quanta);
        }

        let mut exponent = ((magnitude.to_bits() >> 23) & 0xff) as i32 - 127;
        let significand = magnitude / 2f32.powi(exponent);
        let mut mantissa = ((significand - 1.0)
            * (1 << Self::MANTISSA_BITS) as f32)
            .round_ties_even() as i32;
        if mantissa == 1 << Self::MANTISSA_BITS {
            mantissa = 0;
            exponent += 1;
        }
        let biased = exponent + Self::EXPONENT_BIAS;
        let bits = ((biased << Self::MANTISSA_BITS) | mantissa) as u8;
        if bits & 0x7f > Self::MAX_BITS {
            return Self(sign | Self::MAX_BITS);
        }
        Self(sign | bits)
    }

    pub fn to_f32(self) -> f32 {
        if self.is_nan() {
            return f32::NAN;
        }
        let sign = if self.0 & 0x80 != 0 {
            -1.0
        } else {
            1.0
        };
        let exponent = ((self.0 >> 3) & 0x0f) as i32;
        let mantissa = (self.0 & 0x07) as f32 / 8.0;
        let magnitude = if exponent == 0 {
            mantissa * 2f32.powi(Self::MIN_NORMAL_EXP)
        } else {
            (1.0 + mantissa) * 2f32.powi(exponent - Self::EXPONENT_BIAS)
        };
        sign * magnitude
    }
}

impl fmt::Debug for F8E4M3 {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?}", F8E4M3::to_f32(*self))
    }
}

impl fmt::Display for F8E4M3 {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", F8E4M3::to_f32(*self))
    }
}

impl ToPrimitive for F8E4M3 {
    fn to_i64(&self) -> Option<i64> {
        F8E4M3::to_f32(*self).to_i64()
    }

    fn to_u64(&self) -> Option<u64> {
        F8E4M3::to_f32(*self).to_u64()
    }

    fn to_f32(&self) -> Option<f32> {
        Some(F8E4M3::to_f32(*self))
    }

    fn to_f64(&self) -> Option<f64> {
        Some(F8E4M3::to_f32(*self) as f64)
    }
}

impl NumCast for F8E4M3 {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f32().map(F8E4M3::from_f32)
    }
}

pub trait ArrayElement:
    NumCast + Pod + Send + Sync + fmt::Debug + 'static
{
    fn data_type() -> DataType;

    fn to_f32_value(self) -> f32;

    fn from_f32_value(value: f32) -> Self;
}

impl ArrayElement for f16 {
    fn data_type() -> DataType {
        DataType::F16
    }

    fn to_f32_value(self) -> f32 {
        self.to_f32()
    }

    fn from_f32_value(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl ArrayElement for bf16 {
    fn data_type() -> DataType {
        DataType::BF16
    }

    fn to_f32_value(self) -> f32 {
        self.to_f32()
    }

    fn from_f32_value(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

impl ArrayElement for F8E4M3 {
    fn data_type() -> DataType {
        DataType::F8E4M3
    }

    fn to_f32_value(self) -> f32 {
        self.to_f32()
    }

    fn from_f32_value(value: f32) -> Self {
        F8E4M3::from_f32(value)
    }
}

impl ArrayElement for f32 {
    fn data_type() -> DataType {
        DataType::F32
    }

    fn to_f32_value(self) -> f32 {
        self
    }

    fn from_f32_value(value: f32) -> Self {
        value
    }
}

/// Element types accepted as attention inputs.
///
/// `Output` is the element type of the attention output: quantized inputs
/// are promoted to bf16, half-precision inputs keep their own type.
pub trait AttentionElement: ArrayElement {
    type Output: ArrayElement;
}

impl AttentionElement for f16 {
    type Output = f16;
}

impl AttentionElement for bf16 {
    type Output = bf16;
}

impl AttentionElement for F8E4M3 {
    type Output = bf16;
}

/// Elements the standalone combine stage may narrow into.
pub trait CombineElement: ArrayElement {}

impl CombineElement for f32 {}
impl CombineElement for f16 {}
impl CombineElement for bf16 {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f8_exact_values() {
        for value in [0.0f32, 1.0, -1.0, 0.5, 1.75, 448.0, -448.0, 0.015625] {
            assert_eq!(F8E4M3::from_f32(value).to_f32(), value);
        }
    }

    #[test]
    fn test_f8_saturates() {
        assert_eq!(F8E4M3::from_f32(1000.0).to_f32(), 448.0);
        assert_eq!(F8E4M3::from_f32(f32::NEG_INFINITY).to_f32(), -448.0);
        assert!(F8E4M3::from_f32(f32::NAN).is_nan());
    }

    #[test]
    fn test_f8_subnormals() {
        let smallest = 2f32.powi(-9);
        assert_eq!(F8E4M3::from_f32(smallest).to_bits(), 0x01);
        assert_eq!(F8E4M3::from_f32(smallest * 7.0).to_f32(), smallest * 7.0);
        // Rounds up into the first normal binade.
        assert_eq!(F8E4M3::from_f32(smallest * 7.9).to_bits(), 0x08);
    }

    #[test]
    fn test_f8_rounds_to_nearest_even() {
        // 1.0625 sits halfway between 1.0 and 1.125.
        assert_eq!(F8E4M3::from_f32(1.0625).to_f32(), 1.0);
        assert_eq!(F8E4M3::from_f32(1.1875).to_f32(), 1.25);
    }

    #[test]
    fn test_f8_formats_and_casts_as_float() {
        let value = F8E4M3::from_f32(2.5);
        assert_eq!(value.to_string(), "2.5");
        assert_eq!(format!("{value:?}"), "2.5");
        assert_eq!(ToPrimitive::to_f32(&value), Some(2.5));
        assert_eq!(value.to_i64(), Some(2));
        assert_eq!(F8E4M3::from_f32(-3.0).to_u64(), None);
        assert_eq!(<F8E4M3 as NumCast>::from(1.5f64), Some(F8E4M3::from_f32(1.5)));
    }

    #[test]
    fn test_sizes() {
        const F8_BYTES: usize = DataType::F8E4M3.size_in_bytes();
        assert_eq!(F8_BYTES, 1);
        assert_eq!(DataType::BF16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bits(), 32);
    }
}
