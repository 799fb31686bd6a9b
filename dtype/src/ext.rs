use super::*;

pub trait HasDType {
    const DTYPE: DType;
}

/// Host scalar that can live inside a tessel buffer.
///
/// Buffers store elements little-endian regardless of host byte order.
pub trait Element: HasDType + Copy + Send + Sync + PartialEq + std::fmt::Debug + 'static {
    /// Decode from the first `DTYPE.bytes()` bytes of `bytes`.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encode into the first `DTYPE.bytes()` bytes of `out`.
    fn write_le(self, out: &mut [u8]);

    fn to_i64(self) -> i64;

    fn from_i64(value: i64) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl HasDType for $ty {
                const DTYPE: DType = $dtype;
            }

            impl Element for $ty {
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                    <$ty>::from_le_bytes(raw)
                }

                fn write_le(self, out: &mut [u8]) {
                    out[..std::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
                }

                fn to_i64(self) -> i64 {
                    self as i64
                }

                fn from_i64(value: i64) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

impl_element! {
    i8 => DType::Int8, i16 => DType::Int16, i32 => DType::Int32, i64 => DType::Int64,
    u8 => DType::UInt8, u16 => DType::UInt16, u32 => DType::UInt32, u64 => DType::UInt64,
    f32 => DType::Float32, f64 => DType::Float64,
}

impl HasDType for bool {
    const DTYPE: DType = DType::Bool;
}

impl Element for bool {
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write_le(self, out: &mut [u8]) {
        out[0] = self as u8;
    }

    fn to_i64(self) -> i64 {
        self as i64
    }

    fn from_i64(value: i64) -> Self {
        value != 0
    }
}

impl DType {
    /// Decode one little-endian element as an index value; `None` for floats.
    pub fn read_index(&self, bytes: &[u8]) -> Option<i64> {
        let value = match self {
            Self::Bool => bool::read_le(bytes).to_i64(),
            Self::Int8 => i8::read_le(bytes).to_i64(),
            Self::Int16 => i16::read_le(bytes).to_i64(),
            Self::Int32 => i32::read_le(bytes).to_i64(),
            Self::Int64 => i64::read_le(bytes),
            Self::UInt8 => u8::read_le(bytes).to_i64(),
            Self::UInt16 => u16::read_le(bytes).to_i64(),
            Self::UInt32 => u32::read_le(bytes).to_i64(),
            Self::UInt64 => u64::read_le(bytes).to_i64(),
            Self::Float32 | Self::Float64 => return None,
        };
        Some(value)
    }
}
