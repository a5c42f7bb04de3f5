use rust_decimal::{Decimal, RoundingStrategy};

/// Render a dollar amount for display
///
/// Amounts of a dollar or more get 2 decimals, amounts of at least a tenth
/// of a cent get 4, anything smaller gets 6 so it never prints as zero.
pub fn format_cost(cost: Decimal) -> String {
    let places = if cost >= Decimal::ONE {
        2
    } else if cost >= Decimal::new(1, 3) {
        4
    } else {
        6
    };

    format!("${}", fixed(cost, places))
}

/// Render a percentage with one decimal, e.g. `90.0%`
pub fn format_percentage(percentage: Decimal) -> String {
    format!("{}%", fixed(percentage, 1))
}

fn fixed(value: Decimal, places: u32) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(places);
    rounded
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn dollars_use_two_decimals() {
        assert_eq!(format_cost(dec!(3)), "$3.00");
        assert_eq!(format_cost(dec!(12.3456)), "$12.35");
    }

    #[test]
    fn cents_use_four_decimals() {
        assert_eq!(format_cost(dec!(0.015)), "$0.0150");
        assert_eq!(format_cost(dec!(0.001)), "$0.0010");
    }

    #[test]
    fn tiny_amounts_stay_visible() {
        assert_eq!(format_cost(dec!(0.0000045)), "$0.000005");
        assert_eq!(format_cost(Decimal::ZERO), "$0.000000");
    }

    #[test]
    fn percentage() {
        assert_eq!(format_percentage(dec!(90)), "90.0%");
        assert_eq!(format_percentage(dec!(33.333)), "33.3%");
    }
}
