//! Runtime value representation.
//!
//! A [`Value`] is either concrete or a [`Value::Placeholder`] handle into the
//! unification cell arena. Mutable state (vars, mutable arrays and maps,
//! objects, semaphores) lives in the [`Heap`](crate::heap::Heap) and is
//! referenced by handle; immutable aggregates are shared behind `Rc`.

use crate::ids::*;
use crate::vm::natives::NativeFunction;
use lenity_core::TypeTag;
use num_bigint::BigInt;
use num_traits::{One, Signed, ToPrimitive, Zero};
use std::cmp::Ordering;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum Value {
    /// Empty register or field; never observed by ops, which materialize a
    /// placeholder on first read.
    Uninitialized,
    Placeholder(PlaceholderId),
    /// Marker stored in an effect token once its effect has completed.
    EffectDone,
    Int(BigInt),
    Float(f64),
    Rational(Rc<Rational>),
    String(Rc<str>),
    False,
    Option(Rc<Value>),
    Array(Rc<Vec<Value>>),
    Map(Rc<Vec<(Value, Value)>>),
    MutableArray(ArrayId),
    MutableMap(MapId),
    Var(VarId),
    Object(ObjectId),
    Function(FunctionId),
    Native(Rc<NativeFunction>),
    Type(TypeTag),
    Task(TaskId),
    Semaphore(SemaphoreId),
}

impl Value {
    pub fn int(n: i64) -> Self {
        Value::Int(BigInt::from(n))
    }

    pub fn string(s: &str) -> Self {
        Value::String(Rc::from(s))
    }

    /// `true` is `option{false}`, `false` is the bare `false` value.
    pub fn logic(b: bool) -> Self {
        if b {
            Value::Option(Rc::new(Value::False))
        } else {
            Value::False
        }
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Value::Placeholder(_))
    }

    pub fn is_uninitialized(&self) -> bool {
        matches!(self, Value::Uninitialized)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => n.to_i64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Uninitialized => "uninitialized",
            Value::Placeholder(_) => "placeholder",
            Value::EffectDone => "effect-done",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Rational(_) => "rational",
            Value::String(_) => "string",
            Value::False => "false",
            Value::Option(_) => "option",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::MutableArray(_) => "mutable array",
            Value::MutableMap(_) => "mutable map",
            Value::Var(_) => "var",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Native(_) => "native function",
            Value::Type(_) => "type",
            Value::Task(_) => "task",
            Value::Semaphore(_) => "semaphore",
        }
    }
}

/// Shallow identity-or-structure comparison. Placeholders compare by handle;
/// callers that need unification use [`Heap::def`](crate::heap::Heap::def).
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Uninitialized, Value::Uninitialized)
            | (Value::EffectDone, Value::EffectDone)
            | (Value::False, Value::False) => true,
            (Value::Placeholder(a), Value::Placeholder(b)) => a == b,
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::MutableArray(a), Value::MutableArray(b)) => a == b,
            (Value::MutableMap(a), Value::MutableMap(b)) => a == b,
            (Value::Var(a), Value::Var(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Task(a), Value::Task(b)) => a == b,
            (Value::Semaphore(a), Value::Semaphore(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Option(a), Value::Option(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Int(_) | Value::Rational(_), Value::Int(_) | Value::Rational(_)) => matches!(
                (Number::from_value(self), Number::from_value(other)),
                (Some(a), Some(b)) if a.compare(&b) == Some(Ordering::Equal)
            ),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Rationals
// ---------------------------------------------------------------------------

/// Exact rational in lowest terms with a positive denominator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rational {
    num: BigInt,
    den: BigInt,
}

fn gcd(a: &BigInt, b: &BigInt) -> BigInt {
    let mut a = a.abs();
    let mut b = b.abs();
    while !b.is_zero() {
        let t = &a % &b;
        a = b;
        b = t;
    }
    a
}

impl Rational {
    /// `None` when `den` is zero.
    pub fn new(num: BigInt, den: BigInt) -> Option<Self> {
        if den.is_zero() {
            return None;
        }
        let g = gcd(&num, &den);
        let (mut num, mut den) = (num / &g, den / &g);
        if den.is_negative() {
            num = -num;
            den = -den;
        }
        Some(Self { num, den })
    }

    pub fn from_int(n: BigInt) -> Self {
        Self {
            num: n,
            den: BigInt::one(),
        }
    }

    pub fn numerator(&self) -> &BigInt {
        &self.num
    }

    pub fn denominator(&self) -> &BigInt {
        &self.den
    }

    pub fn is_integer(&self) -> bool {
        self.den.is_one()
    }

    fn add(&self, o: &Self) -> Self {
        Self::reduce(&self.num * &o.den + &o.num * &self.den, &self.den * &o.den)
    }

    fn sub(&self, o: &Self) -> Self {
        Self::reduce(&self.num * &o.den - &o.num * &self.den, &self.den * &o.den)
    }

    fn mul(&self, o: &Self) -> Self {
        Self::reduce(&self.num * &o.num, &self.den * &o.den)
    }

    fn div(&self, o: &Self) -> Option<Self> {
        Self::new(&self.num * &o.den, &self.den * &o.num)
    }

    fn reduce(num: BigInt, den: BigInt) -> Self {
        // Denominators multiplied together are never zero.
        Self::new(num, den).unwrap_or_else(|| Self::from_int(BigInt::zero()))
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rational {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.num * &other.den).cmp(&(&other.num * &self.den))
    }
}

// ---------------------------------------------------------------------------
// Numeric tower
// ---------------------------------------------------------------------------

/// Arithmetic view of a concrete value.
#[derive(Debug, Clone)]
pub(crate) enum Number {
    Int(BigInt),
    Rational(Rational),
    Float(f64),
}

/// Outcome of a numeric operation.
pub(crate) enum Arith {
    Value(Value),
    /// Division or modulo by zero: a program failure.
    Fail,
    TypeError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Number {
    pub(crate) fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Int(n) => Some(Number::Int(n.clone())),
            Value::Rational(r) => Some(Number::Rational((**r).clone())),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    fn as_rational(&self) -> Option<Rational> {
        match self {
            Number::Int(n) => Some(Rational::from_int(n.clone())),
            Number::Rational(r) => Some(r.clone()),
            Number::Float(_) => None,
        }
    }

    pub(crate) fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => Some(a.cmp(b)),
            (Number::Float(a), Number::Float(b)) => a.partial_cmp(b),
            _ => Some(self.as_rational()?.cmp(&other.as_rational()?)),
        }
    }
}

fn rational_value(r: Rational) -> Value {
    Value::Rational(Rc::new(r))
}

/// Floored modulo: the result takes the sign of the divisor.
fn mod_floor(a: &BigInt, b: &BigInt) -> BigInt {
    let r = a % b;
    if !r.is_zero() && (r.is_negative() != b.is_negative()) {
        r + b
    } else {
        r
    }
}

pub(crate) fn arith(op: ArithOp, left: &Value, right: &Value) -> Arith {
    if let (ArithOp::Add, Value::String(a), Value::String(b)) = (op, left, right) {
        let mut s = String::with_capacity(a.len() + b.len());
        s.push_str(a);
        s.push_str(b);
        return Arith::Value(Value::String(Rc::from(s)));
    }
    if let (ArithOp::Add, Value::Array(a), Value::Array(b)) = (op, left, right) {
        let mut items = Vec::with_capacity(a.len() + b.len());
        items.extend(a.iter().cloned());
        items.extend(b.iter().cloned());
        return Arith::Value(Value::array(items));
    }
    let (Some(l), Some(r)) = (Number::from_value(left), Number::from_value(right)) else {
        return Arith::TypeError;
    };
    match (l, r) {
        (Number::Int(a), Number::Int(b)) => match op {
            ArithOp::Add => Arith::Value(Value::Int(a + b)),
            ArithOp::Sub => Arith::Value(Value::Int(a - b)),
            ArithOp::Mul => Arith::Value(Value::Int(a * b)),
            ArithOp::Div => match Rational::new(a, b) {
                Some(r) => Arith::Value(rational_value(r)),
                None => Arith::Fail,
            },
            ArithOp::Mod if b.is_zero() => Arith::Fail,
            ArithOp::Mod => Arith::Value(Value::Int(mod_floor(&a, &b))),
        },
        (Number::Float(a), Number::Float(b)) => match op {
            ArithOp::Add => Arith::Value(Value::Float(a + b)),
            ArithOp::Sub => Arith::Value(Value::Float(a - b)),
            ArithOp::Mul => Arith::Value(Value::Float(a * b)),
            ArithOp::Div => Arith::Value(Value::Float(a / b)),
            ArithOp::Mod => Arith::TypeError,
        },
        (l, r) => {
            let (Some(a), Some(b)) = (l.as_rational(), r.as_rational()) else {
                return Arith::TypeError;
            };
            match op {
                ArithOp::Add => Arith::Value(rational_value(a.add(&b))),
                ArithOp::Sub => Arith::Value(rational_value(a.sub(&b))),
                ArithOp::Mul => Arith::Value(rational_value(a.mul(&b))),
                ArithOp::Div => match a.div(&b) {
                    Some(r) => Arith::Value(rational_value(r)),
                    None => Arith::Fail,
                },
                ArithOp::Mod => Arith::TypeError,
            }
        }
    }
}

pub(crate) fn negate(v: &Value) -> Option<Value> {
    match v {
        Value::Int(n) => Some(Value::Int(-n)),
        Value::Float(f) => Some(Value::Float(-f)),
        Value::Rational(r) => Rational::new(-r.numerator().clone(), r.denominator().clone())
            .map(rational_value),
        _ => None,
    }
}

/// Ordering of two concrete values, `None` if they are not comparable.
pub(crate) fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Some(a.cmp(b));
    }
    Number::from_value(left)?.compare(&Number::from_value(right)?)
}

// ---------------------------------------------------------------------------
// Structural equality
// ---------------------------------------------------------------------------

/// One step of a structural comparison between two concrete values.
pub(crate) enum Shallow {
    Equal,
    Unequal,
    /// Equal at the top level; these element pairs still need comparing.
    Nested(Vec<(Value, Value)>),
}

/// Compares the outermost layer of two non-placeholder values.
pub(crate) fn shallow_eq(left: &Value, right: &Value) -> Shallow {
    let verdict = |b: bool| if b { Shallow::Equal } else { Shallow::Unequal };
    match (left, right) {
        (Value::Option(a), Value::Option(b)) => {
            Shallow::Nested(vec![((**a).clone(), (**b).clone())])
        }
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                return Shallow::Unequal;
            }
            Shallow::Nested(a.iter().cloned().zip(b.iter().cloned()).collect())
        }
        (Value::Map(a), Value::Map(b)) => {
            if a.len() != b.len() {
                return Shallow::Unequal;
            }
            let mut pairs = Vec::with_capacity(a.len() * 2);
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                pairs.push((ka.clone(), kb.clone()));
                pairs.push((va.clone(), vb.clone()));
            }
            Shallow::Nested(pairs)
        }
        (Value::Uninitialized, _) | (_, Value::Uninitialized) => Shallow::Unequal,
        _ => verdict(left == right),
    }
}

/// Whether calling the type `tag` with `value` succeeds.
pub(crate) fn type_admits(tag: TypeTag, value: &Value) -> bool {
    match tag {
        TypeTag::Any => true,
        TypeTag::Int => matches!(value, Value::Int(_)),
        TypeTag::Float => matches!(value, Value::Float(_)),
        TypeTag::Rational => matches!(value, Value::Int(_) | Value::Rational(_)),
        TypeTag::String => matches!(value, Value::String(_)),
        TypeTag::Logic => match value {
            Value::False => true,
            Value::Option(inner) => matches!(**inner, Value::False),
            _ => false,
        },
        TypeTag::Array => matches!(value, Value::Array(_) | Value::MutableArray(_)),
        TypeTag::Map => matches!(value, Value::Map(_) | Value::MutableMap(_)),
        TypeTag::Function => matches!(value, Value::Function(_) | Value::Native(_)),
        TypeTag::Task => matches!(value, Value::Task(_)),
    }
}
