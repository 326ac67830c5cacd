//! Channel abstractions for state management

use crate::error::{CheckpointError, Result};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// Base trait for all channels
///
/// Channels are versioned state containers. A channel decides how a batch of
/// writes produced by one superstep is merged into its value; the engine owns
/// the version counter and bumps it whenever [`Channel::update`] reports a
/// change.
pub trait Channel: Send + Sync + Debug {
    /// Get the current value of the channel
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::EmptyChannel`] if the channel has no value
    fn get(&self) -> Result<Value>;

    /// Apply the writes of one superstep, in deterministic task order
    ///
    /// An empty batch is sent to every channel that was not written when a
    /// superstep ends, which lets round-scoped channels reset themselves.
    /// Returns `true` if the channel changed.
    fn update(&mut self, values: Vec<Value>) -> Result<bool>;

    /// Serializable snapshot of the channel, `None` while empty
    fn checkpoint(&self) -> Option<Value>;

    /// Restore the channel from a snapshot produced by [`Channel::checkpoint`]
    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()>;

    /// Whether the channel can currently trigger and be read
    fn is_available(&self) -> bool {
        self.get().is_ok()
    }

    /// Notify the channel that a task subscribed to it ran
    ///
    /// Returns `true` if the channel was updated, `false` otherwise.
    fn consume(&mut self) -> bool {
        false
    }

    /// Short name of the channel kind, used in snapshots and logs
    fn kind(&self) -> &'static str;

    /// Clone the channel into a Box
    ///
    /// The clone never shares mutable state with `self`, so a thread forked
    /// from a checkpoint cannot alias the original.
    fn clone_box(&self) -> Box<dyn Channel>;
}

impl Clone for Box<dyn Channel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// LastValue channel - stores only the latest value
///
/// When several tasks write in the same superstep, the last write in task
/// order wins.
#[derive(Debug, Clone, Default)]
pub struct LastValueChannel {
    value: Option<Value>,
    default: Option<Value>,
}

impl LastValueChannel {
    /// Create a new, empty LastValue channel
    pub fn new() -> Self {
        Self {
            value: None,
            default: None,
        }
    }

    /// Create a LastValue channel that reads as `default` until first written
    pub fn with_default(default: Value) -> Self {
        Self {
            value: None,
            default: Some(default),
        }
    }
}

impl Channel for LastValueChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .or_else(|| self.default.clone())
            .ok_or_else(|| CheckpointError::EmptyChannel("last_value".to_string()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        match values.into_iter().last() {
            Some(value) => {
                self.value = Some(value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some() || self.default.is_some()
    }

    fn kind(&self) -> &'static str {
        "last_value"
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Topic channel - ordered list of written values
///
/// With `accumulate` the list grows across supersteps; otherwise it holds only
/// the values written in the most recent superstep and empties at the next
/// round boundary.
#[derive(Debug, Clone, Default)]
pub struct TopicChannel {
    values: Vec<Value>,
    accumulate: bool,
}

impl TopicChannel {
    /// Create a topic that resets every superstep
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            accumulate: false,
        }
    }

    /// Create a topic that keeps every value ever written
    pub fn accumulating() -> Self {
        Self {
            values: Vec::new(),
            accumulate: true,
        }
    }

    /// Get all values currently held
    pub fn get_all(&self) -> &[Value] {
        &self.values
    }
}

impl Channel for TopicChannel {
    fn get(&self) -> Result<Value> {
        Ok(Value::Array(self.values.clone()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if self.accumulate {
            if values.is_empty() {
                return Ok(false);
            }
            self.values.extend(values);
            return Ok(true);
        }

        let changed = !(values.is_empty() && self.values.is_empty());
        self.values = values;
        Ok(changed)
    }

    fn checkpoint(&self) -> Option<Value> {
        if self.values.is_empty() {
            None
        } else {
            Some(Value::Array(self.values.clone()))
        }
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        match checkpoint {
            Value::Array(values) => {
                self.values = values;
                Ok(())
            }
            other => Err(CheckpointError::Invalid(format!(
                "topic snapshot must be an array, got {other}"
            ))),
        }
    }

    fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    fn kind(&self) -> &'static str {
        "topic"
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Reducer function type for BinaryOperator channel
///
/// Must be associative: the engine may group a round's writes differently
/// from how they were produced.
pub type ReducerFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// BinaryOperator channel - folds writes with an associative operator
///
/// The folded value is what gets checkpointed, so replaying from a
/// checkpoint never re-applies earlier deltas.
#[derive(Clone)]
pub struct BinaryOperatorChannel {
    value: Option<Value>,
    initial: Option<Value>,
    reducer: ReducerFn,
}

impl BinaryOperatorChannel {
    /// Create a new BinaryOperator channel with a custom reducer
    pub fn new<F>(reducer: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        Self {
            value: None,
            initial: None,
            reducer: Arc::new(reducer),
        }
    }

    /// Seed the fold with an identity value, making the channel readable
    /// before its first write
    pub fn with_initial(mut self, initial: Value) -> Self {
        self.value = Some(initial.clone());
        self.initial = Some(initial);
        self
    }

    /// Create a sum reducer (for numbers)
    pub fn sum() -> Self {
        Self::new(|a, b| match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => serde_json::json!(x.wrapping_add(y)),
            _ => serde_json::json!(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
        })
    }

    /// Create an append reducer (for arrays)
    pub fn append() -> Self {
        Self::new(|a, b| {
            let mut result = match a {
                Value::Array(arr) => arr,
                other => vec![other],
            };

            match b {
                Value::Array(arr) => result.extend(arr),
                other => result.push(other),
            }

            Value::Array(result)
        })
    }
}

impl Debug for BinaryOperatorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryOperatorChannel")
            .field("value", &self.value)
            .field("initial", &self.initial)
            .field("reducer", &"<function>")
            .finish()
    }
}

impl Channel for BinaryOperatorChannel {
    fn get(&self) -> Result<Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("binary_operator".to_string()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let Some(delta) = values.into_iter().reduce(|acc, val| (self.reducer)(acc, val)) else {
            return Ok(false);
        };

        self.value = Some(match self.value.take() {
            Some(current) => (self.reducer)(current, delta),
            None => delta,
        });
        Ok(true)
    }

    fn checkpoint(&self) -> Option<Value> {
        self.value.clone()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn kind(&self) -> &'static str {
        "binary_operator"
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_last_value_channel() {
        let mut channel = LastValueChannel::new();
        assert!(!channel.is_available());

        let updated = channel.update(vec![json!(42)]).unwrap();
        assert!(updated);
        assert!(channel.is_available());
        assert_eq!(channel.get().unwrap(), json!(42));

        channel.update(vec![json!(100)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(100));
    }

    #[test]
    fn test_last_value_keeps_one_of_conflicting_writes() {
        let mut channel = LastValueChannel::new();
        channel.update(vec![json!("a"), json!("b")]).unwrap();
        let value = channel.get().unwrap();
        assert!(value == json!("a") || value == json!("b"));
    }

    #[test]
    fn test_last_value_empty_read_fails() {
        let channel = LastValueChannel::new();
        assert!(matches!(channel.get(), Err(CheckpointError::EmptyChannel(_))));
        assert!(channel.checkpoint().is_none());
    }

    #[test]
    fn test_last_value_default() {
        let channel = LastValueChannel::with_default(json!(0));
        assert!(channel.is_available());
        assert_eq!(channel.get().unwrap(), json!(0));
        // The default is not part of the snapshot
        assert!(channel.checkpoint().is_none());
    }

    #[test]
    fn test_empty_update_is_noop_for_last_value() {
        let mut channel = LastValueChannel::new();
        channel.update(vec![json!(1)]).unwrap();
        assert!(!channel.update(vec![]).unwrap());
        assert_eq!(channel.get().unwrap(), json!(1));
    }

    #[test]
    fn test_accumulating_topic() {
        let mut channel = TopicChannel::accumulating();
        assert!(!channel.is_available());
        assert_eq!(channel.get().unwrap(), json!([]));

        channel.update(vec![json!(1), json!(2)]).unwrap();
        channel.update(vec![]).unwrap();
        channel.update(vec![json!(3)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_round_scoped_topic_resets() {
        let mut channel = TopicChannel::new();
        channel.update(vec![json!("x"), json!("y")]).unwrap();
        assert_eq!(channel.get_all().len(), 2);

        channel.update(vec![json!("z")]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(["z"]));

        assert!(channel.update(vec![]).unwrap());
        assert!(!channel.is_available());
        assert!(!channel.update(vec![]).unwrap());
    }

    #[test]
    fn test_topic_restore_rejects_non_array() {
        let mut channel = TopicChannel::accumulating();
        assert!(channel.from_checkpoint(json!({"a": 1})).is_err());
    }

    #[test]
    fn test_binary_operator_sum() {
        let mut channel = BinaryOperatorChannel::sum();
        channel.update(vec![json!(1), json!(2), json!(3)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(6));

        channel.update(vec![json!(4)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(10));
    }

    #[test]
    fn test_binary_operator_float_sum() {
        let mut channel = BinaryOperatorChannel::sum();
        channel.update(vec![json!(10.0), json!(-5.0), json!(3.5)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!(8.5));
    }

    #[test]
    fn test_binary_operator_append() {
        let mut channel = BinaryOperatorChannel::append().with_initial(json!([]));
        assert_eq!(channel.get().unwrap(), json!([]));

        channel.update(vec![json!(1), json!([2, 3])]).unwrap();
        channel.update(vec![json!(4)]).unwrap();
        assert_eq!(channel.get().unwrap(), json!([1, 2, 3, 4]));
    }

    #[test]
    fn test_binary_operator_restore_does_not_reapply() {
        let mut channel = BinaryOperatorChannel::sum();
        channel.update(vec![json!(10), json!(20)]).unwrap();

        let snapshot = channel.checkpoint().unwrap();
        let mut restored = BinaryOperatorChannel::sum();
        restored.from_checkpoint(snapshot).unwrap();
        assert_eq!(restored.get().unwrap(), json!(30));

        restored.update(vec![json!(1)]).unwrap();
        assert_eq!(restored.get().unwrap(), json!(31));
    }

    #[test]
    fn test_clone_box_does_not_alias() {
        let mut original = BinaryOperatorChannel::append();
        original.update(vec![json!("a")]).unwrap();

        let mut forked = original.clone_box();
        forked.update(vec![json!("b")]).unwrap();

        assert_eq!(original.get().unwrap(), json!(["a"]));
        assert_eq!(forked.get().unwrap(), json!(["a", "b"]));
    }

    proptest! {
        #[test]
        fn prop_sum_is_grouping_independent(writes in proptest::collection::vec(-1000i64..1000, 1..8), split in 0usize..8) {
            let split = split.min(writes.len());
            let values: Vec<Value> = writes.iter().map(|w| json!(w)).collect();

            let mut single = BinaryOperatorChannel::sum();
            single.update(values.clone()).unwrap();

            let mut grouped = BinaryOperatorChannel::sum();
            grouped.update(values[..split].to_vec()).unwrap();
            grouped.update(values[split..].to_vec()).unwrap();

            prop_assert_eq!(single.get().unwrap(), json!(writes.iter().sum::<i64>()));
            prop_assert_eq!(single.get().unwrap(), grouped.get().unwrap());
        }

        #[test]
        fn prop_concat_fold_matches_sequential_application(a in "[a-z]{0,4}", b in "[a-z]{0,4}", c in "[a-z]{0,4}") {
            let concat = |x: Value, y: Value| {
                json!(format!("{}{}", x.as_str().unwrap_or_default(), y.as_str().unwrap_or_default()))
            };

            let mut in_one_round = BinaryOperatorChannel::new(concat);
            in_one_round.update(vec![json!(a), json!(b), json!(c)]).unwrap();

            let mut one_by_one = BinaryOperatorChannel::new(concat);
            one_by_one.update(vec![json!(a)]).unwrap();
            one_by_one.update(vec![json!(b)]).unwrap();
            one_by_one.update(vec![json!(c)]).unwrap();

            let expected = json!(format!("{a}{b}{c}"));
            prop_assert_eq!(in_one_round.get().unwrap(), expected.clone());
            prop_assert_eq!(one_by_one.get().unwrap(), expected);
        }
    }
}
