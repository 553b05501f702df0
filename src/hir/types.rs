//! Type lattice, representations, and ranges for the high-level graph

use std::fmt;

/// Physical representation of a value in lowered code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    None,
    Tagged,
    Integer32,
    Double,
    External,
}

impl Representation {
    pub fn is_specialization(self) -> bool {
        matches!(self, Representation::Integer32 | Representation::Double)
    }
}

// The lattice is a bitset: a type is the union of the primitive leaves it
// may be, and combine/intersect are set operations.
const K_NONE: u16 = 0;
const K_SMI: u16 = 1 << 0;
const K_HEAP_NUMBER: u16 = 1 << 1;
const K_STRING: u16 = 1 << 2;
const K_BOOLEAN: u16 = 1 << 3;
const K_UNDEFINED: u16 = 1 << 4;
const K_JS_OBJECT: u16 = 1 << 5;
const K_FUNCTION: u16 = 1 << 6;

const K_NUMBER: u16 = K_SMI | K_HEAP_NUMBER;
const K_PRIMITIVE: u16 = K_NUMBER | K_STRING | K_BOOLEAN | K_UNDEFINED;
const K_NON_PRIMITIVE: u16 = K_JS_OBJECT | K_FUNCTION;
const K_ANY: u16 = K_PRIMITIVE | K_NON_PRIMITIVE;

/// Inferred type of a high-level value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HType(u16);

impl HType {
    pub const NONE: HType = HType(K_NONE);
    pub const SMI: HType = HType(K_SMI);
    pub const HEAP_NUMBER: HType = HType(K_HEAP_NUMBER);
    pub const NUMBER: HType = HType(K_NUMBER);
    pub const STRING: HType = HType(K_STRING);
    pub const BOOLEAN: HType = HType(K_BOOLEAN);
    pub const UNDEFINED: HType = HType(K_UNDEFINED);
    pub const JS_OBJECT: HType = HType(K_JS_OBJECT);
    pub const FUNCTION: HType = HType(K_FUNCTION);
    pub const NON_PRIMITIVE: HType = HType(K_NON_PRIMITIVE);
    pub const ANY: HType = HType(K_ANY);

    /// Least upper bound: the type covering both inputs.
    pub fn combine(self, other: HType) -> HType {
        HType(self.0 | other.0)
    }

    /// Greatest lower bound.
    pub fn intersect(self, other: HType) -> HType {
        HType(self.0 & other.0)
    }

    pub fn is_subtype_of(self, other: HType) -> bool {
        self.0 & other.0 == self.0
    }

    pub fn is_smi(self) -> bool {
        self == HType::SMI
    }

    pub fn is_number(self) -> bool {
        self.0 != K_NONE && self.0 & !K_NUMBER == 0
    }

    pub fn is_boolean(self) -> bool {
        self == HType::BOOLEAN
    }

    pub fn is_non_primitive(self) -> bool {
        self.0 != K_NONE && self.0 & K_PRIMITIVE == 0
    }
}

impl fmt::Debug for HType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            K_NONE => "none",
            K_SMI => "smi",
            K_HEAP_NUMBER => "heap-number",
            K_NUMBER => "number",
            K_STRING => "string",
            K_BOOLEAN => "boolean",
            K_UNDEFINED => "undefined",
            K_JS_OBJECT => "object",
            K_FUNCTION => "function",
            K_NON_PRIMITIVE => "non-primitive",
            K_ANY => "any",
            _ => return write!(f, "type({:#x})", self.0),
        };
        write!(f, "{name}")
    }
}

/// Integer range fact for a value.
///
/// Ranges are a pure function of the operand ranges plus the opcode, so
/// they are recomputed wholesale rather than incrementally patched; a stale
/// set of facts is invalidated by discarding and rerunning the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub lower: i32,
    pub upper: i32,
    pub can_be_minus_zero: bool,
}

impl Range {
    pub fn new(lower: i32, upper: i32) -> Range {
        debug_assert!(lower <= upper);
        Range {
            lower,
            upper,
            can_be_minus_zero: false,
        }
    }

    pub fn constant(value: i32) -> Range {
        Range::new(value, value)
    }

    pub fn full() -> Range {
        Range {
            lower: i32::MIN,
            upper: i32::MAX,
            can_be_minus_zero: true,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.lower == self.upper
    }

    pub fn includes(&self, value: i32) -> bool {
        self.lower <= value && value <= self.upper
    }

    /// Sum of two ranges; `None` when the bounds overflow 32 bits.
    pub fn add(&self, other: &Range) -> Option<Range> {
        let lower = (self.lower as i64) + (other.lower as i64);
        let upper = (self.upper as i64) + (other.upper as i64);
        Self::from_i64(lower, upper, false)
    }

    pub fn sub(&self, other: &Range) -> Option<Range> {
        let lower = (self.lower as i64) - (other.upper as i64);
        let upper = (self.upper as i64) - (other.lower as i64);
        Self::from_i64(lower, upper, false)
    }

    pub fn mul(&self, other: &Range) -> Option<Range> {
        let products = [
            (self.lower as i64) * (other.lower as i64),
            (self.lower as i64) * (other.upper as i64),
            (self.upper as i64) * (other.lower as i64),
            (self.upper as i64) * (other.upper as i64),
        ];
        let lower = *products.iter().min().unwrap();
        let upper = *products.iter().max().unwrap();
        // A product of a negative and a zero-crossing range can produce -0.
        let minus_zero = (self.includes(0) && other.lower < 0)
            || (other.includes(0) && self.lower < 0);
        Self::from_i64(lower, upper, minus_zero)
    }

    fn from_i64(lower: i64, upper: i64, minus_zero: bool) -> Option<Range> {
        if lower < i32::MIN as i64 || upper > i32::MAX as i64 {
            return None;
        }
        Some(Range {
            lower: lower as i32,
            upper: upper as i32,
            can_be_minus_zero: minus_zero,
        })
    }

    /// Union of two ranges (for phi joins).
    pub fn union(&self, other: &Range) -> Range {
        Range {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
            can_be_minus_zero: self.can_be_minus_zero || other.can_be_minus_zero,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_is_lub() {
        assert_eq!(HType::SMI.combine(HType::HEAP_NUMBER), HType::NUMBER);
        assert!(HType::SMI.is_subtype_of(HType::NUMBER));
        assert!(HType::NUMBER.combine(HType::STRING).is_subtype_of(HType::ANY));
        assert!(!HType::NUMBER.is_subtype_of(HType::SMI));
    }

    #[test]
    fn test_intersect_is_glb() {
        assert_eq!(HType::NUMBER.intersect(HType::SMI), HType::SMI);
        assert_eq!(HType::STRING.intersect(HType::NUMBER), HType::NONE);
    }

    #[test]
    fn test_is_number() {
        assert!(HType::SMI.is_number());
        assert!(HType::NUMBER.is_number());
        assert!(!HType::ANY.is_number());
        assert!(!HType::NONE.is_number());
    }

    #[test]
    fn test_range_add_overflow() {
        let big = Range::new(i32::MAX - 1, i32::MAX);
        assert!(big.add(&Range::constant(2)).is_none());
        assert_eq!(
            Range::constant(1).add(&Range::constant(2)),
            Some(Range::constant(3))
        );
    }

    #[test]
    fn test_range_mul_minus_zero() {
        let negative = Range::new(-5, -1);
        let crossing = Range::new(-1, 1);
        let product = negative.mul(&crossing).unwrap();
        assert!(product.can_be_minus_zero);
        let positive = Range::new(1, 5);
        assert!(!positive.mul(&positive).unwrap().can_be_minus_zero);
    }

    #[test]
    fn test_range_union() {
        let a = Range::new(0, 5);
        let b = Range::new(3, 9);
        assert_eq!(a.union(&b), Range::new(0, 9));
    }
}
