//! # Mergeable Aggregation
//!
//! The lift / combine / lower algebra that makes slice-based windowing work.
//!
//! - `lift` turns one record value into a partial-aggregate state
//! - `combine` merges two partial states into one
//! - `lower` extracts the final result from a state
//!
//! `combine` must be associative and commutative. That is the property the
//! whole engine rests on: slices can be pre-aggregated per node, shipped in
//! any order, and merged downstream without changing the result. The
//! built-in functions all satisfy it; custom implementations must too.
//!
//! Sum and average accumulate in `i128` so per-record overflow is not
//! reachable with `i64` inputs; overflow is checked at combine and lower
//! time and surfaces as [`AggregateError::Overflow`], never as wraparound.
//!
//! # Example
//!
//! ```rust
//! use slicestream_core::aggregate::{AggregationFunction, Sum};
//!
//! let sum = Sum::new();
//! let a = sum.lift(3);
//! let b = sum.lift(4);
//! let merged = sum.combine(a, b).unwrap();
//! assert_eq!(sum.lower(&merged).unwrap().as_i64(), Some(7));
//! ```

use arrow_schema::DataType;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};

/// Errors from aggregate evaluation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AggregateError {
    /// A combine or lower step exceeded the representable range.
    #[error("aggregate overflow in {function}")]
    Overflow {
        /// Name of the aggregation function that overflowed
        function: &'static str,
    },
}

/// The final value lowered from a window's merged state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarResult {
    /// Signed integer result (sum, min, max)
    Int64(i64),
    /// Unsigned integer result (count)
    UInt64(u64),
    /// Floating point result (average)
    Float64(f64),
    /// No value: the window matched no records, or overflow was handled
    /// by failing the window.
    Null,
}

impl ScalarResult {
    /// Returns the value as `i64` if it is an integer that fits.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            Self::UInt64(v) => i64::try_from(*v).ok(),
            Self::Float64(_) | Self::Null => None,
        }
    }

    /// Returns the value as `f64` if it is numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::UInt64(v) => Some(*v as f64),
            Self::Float64(v) => Some(*v),
            Self::Null => None,
        }
    }

    /// Returns true for [`ScalarResult::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the Arrow data type carrying this value.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int64(_) => DataType::Int64,
            Self::UInt64(_) => DataType::UInt64,
            Self::Float64(_) | Self::Null => DataType::Float64,
        }
    }
}

/// A mergeable aggregation function.
///
/// Implementations must keep `combine` associative and commutative, and the
/// state produced by [`AggregationFunction::identity`] must be a neutral
/// element: `combine(identity, s) == s`.
pub trait AggregationFunction: Send + Sync + 'static {
    /// Partial-aggregate state held per key per slice.
    type State: Clone + Send + Sync + 'static;

    /// Name used in error reporting and logs.
    fn name(&self) -> &'static str;

    /// Arrow type of the lowered result column.
    fn output_type(&self) -> DataType;

    /// The neutral state for an empty slice.
    fn identity(&self) -> Self::State;

    /// Lifts one record value into a partial state.
    fn lift(&self, value: i64) -> Self::State;

    /// Merges two partial states.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Overflow`] when the merged state exceeds
    /// the representable range.
    fn combine(&self, a: Self::State, b: Self::State) -> Result<Self::State, AggregateError>;

    /// Extracts the final result from a merged state.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Overflow`] when the result does not fit
    /// the output type.
    fn lower(&self, state: &Self::State) -> Result<ScalarResult, AggregateError>;

    /// Extracts the final result, clamping instead of failing on overflow.
    fn lower_saturating(&self, state: &Self::State) -> ScalarResult;
}

/// Counts records.
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

/// Count partial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct CountState(pub u64);

impl Count {
    /// Creates a count function.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AggregationFunction for Count {
    type State = CountState;

    fn name(&self) -> &'static str {
        "count"
    }

    fn output_type(&self) -> DataType {
        DataType::UInt64
    }

    fn identity(&self) -> CountState {
        CountState(0)
    }

    fn lift(&self, _value: i64) -> CountState {
        CountState(1)
    }

    fn combine(&self, a: CountState, b: CountState) -> Result<CountState, AggregateError> {
        a.0.checked_add(b.0)
            .map(CountState)
            .ok_or(AggregateError::Overflow { function: "count" })
    }

    fn lower(&self, state: &CountState) -> Result<ScalarResult, AggregateError> {
        Ok(ScalarResult::UInt64(state.0))
    }

    fn lower_saturating(&self, state: &CountState) -> ScalarResult {
        ScalarResult::UInt64(state.0)
    }
}

/// Sums record values. Accumulates in `i128`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

/// Sum partial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct SumState(pub i128);

impl Sum {
    /// Creates a sum function.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AggregationFunction for Sum {
    type State = SumState;

    fn name(&self) -> &'static str {
        "sum"
    }

    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn identity(&self) -> SumState {
        SumState(0)
    }

    fn lift(&self, value: i64) -> SumState {
        SumState(i128::from(value))
    }

    fn combine(&self, a: SumState, b: SumState) -> Result<SumState, AggregateError> {
        a.0.checked_add(b.0)
            .map(SumState)
            .ok_or(AggregateError::Overflow { function: "sum" })
    }

    fn lower(&self, state: &SumState) -> Result<ScalarResult, AggregateError> {
        i64::try_from(state.0)
            .map(ScalarResult::Int64)
            .map_err(|_| AggregateError::Overflow { function: "sum" })
    }

    fn lower_saturating(&self, state: &SumState) -> ScalarResult {
        let clamped = state.0.clamp(i128::from(i64::MIN), i128::from(i64::MAX));
        #[allow(clippy::cast_possible_truncation)]
        ScalarResult::Int64(clamped as i64)
    }
}

/// Tracks the minimum record value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

/// Min partial state. `None` until the first record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct MinState(pub Option<i64>);

impl Min {
    /// Creates a min function.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AggregationFunction for Min {
    type State = MinState;

    fn name(&self) -> &'static str {
        "min"
    }

    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn identity(&self) -> MinState {
        MinState(None)
    }

    fn lift(&self, value: i64) -> MinState {
        MinState(Some(value))
    }

    fn combine(&self, a: MinState, b: MinState) -> Result<MinState, AggregateError> {
        Ok(MinState(match (a.0, b.0) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (v, None) | (None, v) => v,
        }))
    }

    fn lower(&self, state: &MinState) -> Result<ScalarResult, AggregateError> {
        Ok(state.0.map_or(ScalarResult::Null, ScalarResult::Int64))
    }

    fn lower_saturating(&self, state: &MinState) -> ScalarResult {
        state.0.map_or(ScalarResult::Null, ScalarResult::Int64)
    }
}

/// Tracks the maximum record value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

/// Max partial state. `None` until the first record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct MaxState(pub Option<i64>);

impl Max {
    /// Creates a max function.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AggregationFunction for Max {
    type State = MaxState;

    fn name(&self) -> &'static str {
        "max"
    }

    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn identity(&self) -> MaxState {
        MaxState(None)
    }

    fn lift(&self, value: i64) -> MaxState {
        MaxState(Some(value))
    }

    fn combine(&self, a: MaxState, b: MaxState) -> Result<MaxState, AggregateError> {
        Ok(MaxState(match (a.0, b.0) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (v, None) | (None, v) => v,
        }))
    }

    fn lower(&self, state: &MaxState) -> Result<ScalarResult, AggregateError> {
        Ok(state.0.map_or(ScalarResult::Null, ScalarResult::Int64))
    }

    fn lower_saturating(&self, state: &MaxState) -> ScalarResult {
        state.0.map_or(ScalarResult::Null, ScalarResult::Int64)
    }
}

/// Averages record values.
///
/// The partial state keeps sum and count separately so partial averages
/// merge exactly; the division happens once, at lower time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Avg;

/// Average partial state: running sum and count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct AvgState {
    /// Sum of values seen so far
    pub sum: i128,
    /// Number of values seen so far
    pub count: u64,
}

impl Avg {
    /// Creates an average function.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AggregationFunction for Avg {
    type State = AvgState;

    fn name(&self) -> &'static str {
        "avg"
    }

    fn output_type(&self) -> DataType {
        DataType::Float64
    }

    fn identity(&self) -> AvgState {
        AvgState::default()
    }

    fn lift(&self, value: i64) -> AvgState {
        AvgState {
            sum: i128::from(value),
            count: 1,
        }
    }

    fn combine(&self, a: AvgState, b: AvgState) -> Result<AvgState, AggregateError> {
        let sum = a
            .sum
            .checked_add(b.sum)
            .ok_or(AggregateError::Overflow { function: "avg" })?;
        let count = a
            .count
            .checked_add(b.count)
            .ok_or(AggregateError::Overflow { function: "avg" })?;
        Ok(AvgState { sum, count })
    }

    #[allow(clippy::cast_precision_loss)]
    fn lower(&self, state: &AvgState) -> Result<ScalarResult, AggregateError> {
        if state.count == 0 {
            return Ok(ScalarResult::Null);
        }
        Ok(ScalarResult::Float64(state.sum as f64 / state.count as f64))
    }

    fn lower_saturating(&self, state: &AvgState) -> ScalarResult {
        // The division result always fits in f64; same path as lower.
        self.lower(state).unwrap_or(ScalarResult::Null)
    }
}

/// A user-defined mergeable aggregation built from plain functions.
///
/// For aggregations beyond the built-ins: provide the four algebra
/// functions and the output type. The `combine` function must be
/// associative and commutative, like every implementation of
/// [`AggregationFunction`].
///
/// # Example
///
/// ```rust
/// use slicestream_core::aggregate::{AggregationFunction, Combinable, ScalarResult};
/// use arrow_schema::DataType;
///
/// // Product of values, saturating.
/// let product = Combinable::new(
///     "product",
///     DataType::Int64,
///     || 1i64,
///     |v| v,
///     |a, b| Ok(a.saturating_mul(b)),
///     |s| Ok(ScalarResult::Int64(*s)),
/// );
/// let merged = product.combine(product.lift(3), product.lift(4)).unwrap();
/// assert_eq!(product.lower(&merged).unwrap(), ScalarResult::Int64(12));
/// ```
pub struct Combinable<S> {
    name: &'static str,
    output: DataType,
    identity: fn() -> S,
    lift: fn(i64) -> S,
    combine: fn(S, S) -> Result<S, AggregateError>,
    lower: fn(&S) -> Result<ScalarResult, AggregateError>,
}

impl<S> std::fmt::Debug for Combinable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Combinable").field("name", &self.name).finish()
    }
}

impl<S> Combinable<S> {
    /// Creates an aggregation from function pointers.
    #[must_use]
    pub fn new(
        name: &'static str,
        output: DataType,
        identity: fn() -> S,
        lift: fn(i64) -> S,
        combine: fn(S, S) -> Result<S, AggregateError>,
        lower: fn(&S) -> Result<ScalarResult, AggregateError>,
    ) -> Self {
        Self {
            name,
            output,
            identity,
            lift,
            combine,
            lower,
        }
    }
}

impl<S: Clone + Send + Sync + 'static> AggregationFunction for Combinable<S> {
    type State = S;

    fn name(&self) -> &'static str {
        self.name
    }

    fn output_type(&self) -> DataType {
        self.output.clone()
    }

    fn identity(&self) -> S {
        (self.identity)()
    }

    fn lift(&self, value: i64) -> S {
        (self.lift)(value)
    }

    fn combine(&self, a: S, b: S) -> Result<S, AggregateError> {
        (self.combine)(a, b)
    }

    fn lower(&self, state: &S) -> Result<ScalarResult, AggregateError> {
        (self.lower)(state)
    }

    fn lower_saturating(&self, state: &S) -> ScalarResult {
        (self.lower)(state).unwrap_or(ScalarResult::Null)
    }
}
