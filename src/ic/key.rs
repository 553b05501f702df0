//! Cache-key encoding for shared stubs
//!
//! Shared (non-IC) stubs are memoized by a dense integer key packing the
//! operation kind (major key) with a per-kind discriminant (minor key).
//! Minor keys are themselves bit-packed sub-fields with fixed widths;
//! exceeding a width is a programmer error caught by debug assertions, not
//! a runtime failure.

/// Operation kind of a shared stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MajorKey {
    LoadIc,
    StoreIc,
    KeyedLoadIc,
    KeyedStoreIc,
    CallIc,
    Construct,
    Compare,
    BinaryOp,
    ToBoolean,
    StackCheck,
}

const MAJOR_BITS: u32 = 6;

impl MajorKey {
    pub fn bits(self) -> u32 {
        match self {
            MajorKey::LoadIc => 0,
            MajorKey::StoreIc => 1,
            MajorKey::KeyedLoadIc => 2,
            MajorKey::KeyedStoreIc => 3,
            MajorKey::CallIc => 4,
            MajorKey::Construct => 5,
            MajorKey::Compare => 6,
            MajorKey::BinaryOp => 7,
            MajorKey::ToBoolean => 8,
            MajorKey::StackCheck => 9,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        match bits {
            0 => MajorKey::LoadIc,
            1 => MajorKey::StoreIc,
            2 => MajorKey::KeyedLoadIc,
            3 => MajorKey::KeyedStoreIc,
            4 => MajorKey::CallIc,
            5 => MajorKey::Construct,
            6 => MajorKey::Compare,
            7 => MajorKey::BinaryOp,
            8 => MajorKey::ToBoolean,
            _ => MajorKey::StackCheck,
        }
    }
}

/// Dense cache key for a (major, minor) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u32);

impl CacheKey {
    /// Pack `(major, minor)` into one key. Bijective for all minor values
    /// below 2^26.
    pub fn encode(major: MajorKey, minor: u32) -> CacheKey {
        debug_assert!(major.bits() < (1 << MAJOR_BITS));
        debug_assert!(minor < (1 << (32 - MAJOR_BITS)), "minor key overflow");
        CacheKey((minor << MAJOR_BITS) | major.bits())
    }

    pub fn decode(self) -> (MajorKey, u32) {
        (
            MajorKey::from_bits(self.0 & ((1 << MAJOR_BITS) - 1)),
            self.0 >> MAJOR_BITS,
        )
    }

    pub fn major(self) -> MajorKey {
        self.decode().0
    }

    pub fn minor(self) -> u32 {
        self.decode().1
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Encode `value` into a sub-field of a minor key.
///
/// Sub-field widths are fixed at build time; callers must not exceed them.
#[inline]
pub fn encode_field(value: u32, shift: u32, size: u32) -> u32 {
    debug_assert!(size < 32 && shift + size <= 32);
    debug_assert!(value < (1 << size), "minor-key sub-field overflow");
    value << shift
}

/// Decode a sub-field of a minor key.
#[inline]
pub fn decode_field(packed: u32, shift: u32, size: u32) -> u32 {
    (packed >> shift) & ((1 << size) - 1)
}

/// Comparison operator token carried by compare stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareToken {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompareToken {
    fn bits(self) -> u32 {
        match self {
            CompareToken::Eq => 0,
            CompareToken::Ne => 1,
            CompareToken::Lt => 2,
            CompareToken::Gt => 3,
            CompareToken::Le => 4,
            CompareToken::Ge => 5,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => CompareToken::Eq,
            1 => CompareToken::Ne,
            2 => CompareToken::Lt,
            3 => CompareToken::Gt,
            4 => CompareToken::Le,
            _ => CompareToken::Ge,
        }
    }
}

/// Minor key for compare stubs: operator token plus strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareMinor {
    pub token: CompareToken,
    pub strict: bool,
}

const COMPARE_TOKEN_SHIFT: u32 = 0;
const COMPARE_TOKEN_BITS: u32 = 3;
const COMPARE_STRICT_SHIFT: u32 = COMPARE_TOKEN_SHIFT + COMPARE_TOKEN_BITS;

impl CompareMinor {
    pub fn encode(self) -> u32 {
        encode_field(self.token.bits(), COMPARE_TOKEN_SHIFT, COMPARE_TOKEN_BITS)
            | encode_field(self.strict as u32, COMPARE_STRICT_SHIFT, 1)
    }

    pub fn decode(packed: u32) -> Self {
        CompareMinor {
            token: CompareToken::from_bits(decode_field(
                packed,
                COMPARE_TOKEN_SHIFT,
                COMPARE_TOKEN_BITS,
            )),
            strict: decode_field(packed, COMPARE_STRICT_SHIFT, 1) != 0,
        }
    }
}

/// Observed-operand feedback carried by binary-op stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFeedback {
    Uninitialized,
    SmallInteger,
    Number,
    Generic,
}

impl TypeFeedback {
    fn bits(self) -> u32 {
        match self {
            TypeFeedback::Uninitialized => 0,
            TypeFeedback::SmallInteger => 1,
            TypeFeedback::Number => 2,
            TypeFeedback::Generic => 3,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => TypeFeedback::SmallInteger,
            2 => TypeFeedback::Number,
            3 => TypeFeedback::Generic,
            _ => TypeFeedback::Uninitialized,
        }
    }
}

/// Minor key for binary-op stubs: arithmetic token, overwrite mode, and
/// runtime-observed type feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryOpMinor {
    /// Arithmetic token index (Add, Sub, Mul, ...).
    pub token: u32,
    /// Whether the result may overwrite the left or right operand in place.
    pub overwrite: u32,
    pub feedback: TypeFeedback,
}

const BINOP_TOKEN_SHIFT: u32 = 0;
const BINOP_TOKEN_BITS: u32 = 4;
const BINOP_OVERWRITE_SHIFT: u32 = BINOP_TOKEN_SHIFT + BINOP_TOKEN_BITS;
const BINOP_OVERWRITE_BITS: u32 = 2;
const BINOP_FEEDBACK_SHIFT: u32 = BINOP_OVERWRITE_SHIFT + BINOP_OVERWRITE_BITS;
const BINOP_FEEDBACK_BITS: u32 = 2;

impl BinaryOpMinor {
    pub fn encode(self) -> u32 {
        encode_field(self.token, BINOP_TOKEN_SHIFT, BINOP_TOKEN_BITS)
            | encode_field(self.overwrite, BINOP_OVERWRITE_SHIFT, BINOP_OVERWRITE_BITS)
            | encode_field(
                self.feedback.bits(),
                BINOP_FEEDBACK_SHIFT,
                BINOP_FEEDBACK_BITS,
            )
    }

    pub fn decode(packed: u32) -> Self {
        BinaryOpMinor {
            token: decode_field(packed, BINOP_TOKEN_SHIFT, BINOP_TOKEN_BITS),
            overwrite: decode_field(packed, BINOP_OVERWRITE_SHIFT, BINOP_OVERWRITE_BITS),
            feedback: TypeFeedback::from_bits(decode_field(
                packed,
                BINOP_FEEDBACK_SHIFT,
                BINOP_FEEDBACK_BITS,
            )),
        }
    }
}

/// Minor key for call stubs: argument count plus an in-loop hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallMinor {
    pub argc: u32,
    pub in_loop: bool,
}

const CALL_ARGC_SHIFT: u32 = 0;
const CALL_ARGC_BITS: u32 = 8;
const CALL_IN_LOOP_SHIFT: u32 = CALL_ARGC_SHIFT + CALL_ARGC_BITS;

impl CallMinor {
    pub fn encode(self) -> u32 {
        encode_field(self.argc, CALL_ARGC_SHIFT, CALL_ARGC_BITS)
            | encode_field(self.in_loop as u32, CALL_IN_LOOP_SHIFT, 1)
    }

    pub fn decode(packed: u32) -> Self {
        CallMinor {
            argc: decode_field(packed, CALL_ARGC_SHIFT, CALL_ARGC_BITS),
            in_loop: decode_field(packed, CALL_IN_LOOP_SHIFT, 1) != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_bijection() {
        let majors = [
            MajorKey::LoadIc,
            MajorKey::StoreIc,
            MajorKey::KeyedLoadIc,
            MajorKey::KeyedStoreIc,
            MajorKey::CallIc,
            MajorKey::Construct,
            MajorKey::Compare,
            MajorKey::BinaryOp,
            MajorKey::ToBoolean,
            MajorKey::StackCheck,
        ];
        for major in majors {
            for minor in [0u32, 1, 2, 255, 1 << 20, (1 << 26) - 1] {
                let key = CacheKey::encode(major, minor);
                assert_eq!(key.decode(), (major, minor));
            }
        }
    }

    #[test]
    fn test_distinct_pairs_distinct_keys() {
        let a = CacheKey::encode(MajorKey::Compare, 3);
        let b = CacheKey::encode(MajorKey::BinaryOp, 3);
        let c = CacheKey::encode(MajorKey::Compare, 4);
        assert_ne!(a.bits(), b.bits());
        assert_ne!(a.bits(), c.bits());
    }

    #[test]
    fn test_compare_minor_roundtrip() {
        for token in [
            CompareToken::Eq,
            CompareToken::Ne,
            CompareToken::Lt,
            CompareToken::Gt,
            CompareToken::Le,
            CompareToken::Ge,
        ] {
            for strict in [false, true] {
                let minor = CompareMinor { token, strict };
                assert_eq!(CompareMinor::decode(minor.encode()), minor);
            }
        }
    }

    #[test]
    fn test_binary_op_minor_roundtrip() {
        let minor = BinaryOpMinor {
            token: 9,
            overwrite: 2,
            feedback: TypeFeedback::Number,
        };
        let key = CacheKey::encode(MajorKey::BinaryOp, minor.encode());
        assert_eq!(BinaryOpMinor::decode(key.minor()), minor);
    }

    #[test]
    fn test_call_minor_roundtrip() {
        for argc in [0u32, 1, 7, 255] {
            for in_loop in [false, true] {
                let minor = CallMinor { argc, in_loop };
                assert_eq!(CallMinor::decode(minor.encode()), minor);
            }
        }
    }

    #[test]
    #[should_panic(expected = "minor-key sub-field overflow")]
    #[cfg(debug_assertions)]
    fn test_subfield_overflow_asserts() {
        let minor = CallMinor {
            argc: 256,
            in_loop: false,
        };
        let _ = minor.encode();
    }
}
