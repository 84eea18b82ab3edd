/// Asserts that two integer expressions are within `margin` of each other.
#[macro_export]
macro_rules! assert_near {
    ($actual:expr, $expected:expr, $margin:expr) => {{
        let (actual, expected, margin) = ($actual as i128, $expected as i128, $margin as i128);
        if actual + margin < expected || expected + margin < actual {
            panic!("assertion failed: {} is not within {} of {}", actual, margin, expected);
        }
    }};
}
