//! Macros for ergonomic state matrix construction.

/// Build a transition table as `(event, target)` pairs.
///
/// # Example
///
/// ```
/// use trialsm::builder::StateSpec;
/// use trialsm::transitions;
///
/// let spec = StateSpec::new("wait_for_poke")
///     .timer(5.0)
///     .transitions(transitions! {
///         "Cin" => "reward",
///         "Tup" => "END",
///     });
///
/// assert_eq!(spec.target_for("Cin"), Some("reward"));
/// ```
#[macro_export]
macro_rules! transitions {
    () => {
        ::std::vec::Vec::<(::std::string::String, ::std::string::String)>::new()
    };
    (
        $($event:expr => $target:expr),+ $(,)?
    ) => {
        ::std::vec![
            $((::std::string::String::from($event), ::std::string::String::from($target))),+
        ]
    };
}

/// Build a [`StateSpec`](crate::builder::StateSpec) in one expression.
///
/// # Example
///
/// ```
/// use trialsm::state;
///
/// let spec = state! {
///     "left_valve_on",
///     timer: 0.1,
///     on: ["ValveL"],
///     off: ["ValveR"],
///     transitions: { "Tup" => "left_valve_off" },
/// };
///
/// assert_eq!(spec.outputs_on, vec!["ValveL".to_string()]);
/// ```
#[macro_export]
macro_rules! state {
    (
        $name:expr
        $(, timer: $timer:expr)?
        $(, on: [$($on:expr),* $(,)?])?
        $(, off: [$($off:expr),* $(,)?])?
        $(, transitions: { $($event:expr => $target:expr),* $(,)? })?
        $(,)?
    ) => {{
        #[allow(unused_mut)]
        let mut spec = $crate::builder::StateSpec::new($name);
        $(spec = spec.timer($timer);)?
        $(spec = spec.outputs_on([$($on),*]);)?
        $(spec = spec.outputs_off([$($off),*]);)?
        $($(spec = spec.on($event, $target);)*)?
        spec
    }};
}
