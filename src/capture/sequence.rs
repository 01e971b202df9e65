//! Power-rail sequencing.
//!
//! Rails must come up in supply-dependency order: I/O first, then the analog
//! rails, core last. Rails without a known priority follow the named ones in
//! their input order. Power-down is the exact reverse.

/// Known rails, in power-on order.
pub const RAIL_PRIORITY: [&str; 4] = ["VDDIO", "VDDA1V8_AON", "VDDA1V8", "VDDCORE"];

fn priority(name: &str) -> usize {
    RAIL_PRIORITY
        .iter()
        .position(|rail| rail.eq_ignore_ascii_case(name))
        .unwrap_or(RAIL_PRIORITY.len())
}

/// Indices of `names` in power-on order.
pub fn power_on_order<S: AsRef<str>>(names: &[S]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..names.len()).collect();
    // stable: unknown rails keep their relative input order
    order.sort_by_key(|&i| priority(names[i].as_ref()));
    order
}

/// Indices of `names` in power-off order.
pub fn power_off_order<S: AsRef<str>>(names: &[S]) -> Vec<usize> {
    let mut order = power_on_order(names);
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named<'a>(names: &[&'a str], order: &[usize]) -> Vec<&'a str> {
        order.iter().map(|&i| names[i]).collect()
    }

    #[test]
    fn test_named_rails_in_any_input_order() {
        let inputs: [[&str; 4]; 4] = [
            ["VDDCORE", "VDDIO", "VDDA1V8", "VDDA1V8_AON"],
            ["VDDA1V8", "VDDA1V8_AON", "VDDCORE", "VDDIO"],
            ["VDDIO", "VDDCORE", "VDDA1V8_AON", "VDDA1V8"],
            ["VDDA1V8_AON", "VDDA1V8", "VDDIO", "VDDCORE"],
        ];
        for names in inputs {
            let on = named(&names, &power_on_order(&names));
            assert_eq!(on, vec!["VDDIO", "VDDA1V8_AON", "VDDA1V8", "VDDCORE"]);
            let mut off = named(&names, &power_off_order(&names));
            off.reverse();
            assert_eq!(off, on);
        }
    }

    #[test]
    fn test_unknown_rails_last_and_stable() {
        let names = ["VBAT", "VDDCORE", "VREF", "VDDIO"];
        let on = named(&names, &power_on_order(&names));
        assert_eq!(on, vec!["VDDIO", "VDDCORE", "VBAT", "VREF"]);
        let off = named(&names, &power_off_order(&names));
        assert_eq!(off, vec!["VREF", "VBAT", "VDDCORE", "VDDIO"]);
    }

    #[test]
    fn test_case_insensitive_names() {
        let names = ["vddcore", "vddio"];
        assert_eq!(power_on_order(&names), vec![1, 0]);
    }
}
