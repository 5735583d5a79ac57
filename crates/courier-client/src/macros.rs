// Metric macro wrappers: real `metrics` handles with the telemetry feature,
// no-ops without it.

#[cfg(feature = "telemetry")]
#[allow(unused_macros)]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        metrics::counter!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
#[allow(unused_macros)]
macro_rules! t_counter {
    ($($tt:tt)*) => {
        $crate::macros::NoopCounter
    };
}

#[cfg(feature = "telemetry")]
#[allow(unused_macros)]
macro_rules! t_gauge {
    ($($tt:tt)*) => {
        metrics::gauge!($($tt)*)
    };
}

#[cfg(not(feature = "telemetry"))]
#[allow(unused_macros)]
macro_rules! t_gauge {
    ($($tt:tt)*) => {
        $crate::macros::NoopGauge
    };
}

#[cfg(not(feature = "telemetry"))]
#[allow(dead_code)]
#[derive(Copy, Clone)]
pub(crate) struct NoopCounter;

#[cfg(not(feature = "telemetry"))]
impl NoopCounter {
    pub(crate) fn increment(&self, _value: u64) {}
}

#[cfg(not(feature = "telemetry"))]
#[allow(dead_code)]
#[derive(Copy, Clone)]
pub(crate) struct NoopGauge;

#[cfg(not(feature = "telemetry"))]
impl NoopGauge {
    pub(crate) fn set(&self, _value: f64) {}
}

#[cfg(test)]
mod tests {
    #[test]
    #[cfg(not(feature = "telemetry"))]
    fn noop_handles_do_not_panic() {
        t_counter!("test_counter").increment(1);
        t_gauge!("test_gauge").set(1.0);
    }
}
