use std::time::{SystemTime, UNIX_EPOCH};

use crate::objects::object::NativeObject;
use crate::value::{make_number_value, Value};

/// The `clock()` built-in: seconds since the epoch as a double. Mostly
/// useful for timing scripts.
pub struct ClockTime;

impl NativeObject for ClockTime {
    fn call(&self, _args: &[Value]) -> Result<Value, String> {
        let now = SystemTime::now();
        let duration = now
            .duration_since(UNIX_EPOCH)
            .map_err(|_| "Time went backwards".to_string())?;
        Ok(make_number_value(duration.as_secs_f64()))
    }
}

impl ClockTime {
    pub fn new() -> Self {
        ClockTime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{as_number, is_number};

    #[test]
    fn test_clock_returns_positive_number() {
        let clock = ClockTime::new();
        let value = clock.call(&[]).expect("clock should not fail");
        assert!(is_number(&value));
        assert!(as_number(&value) > 0.0);
    }
}
