//! Routing of related record names into shared file units.
//!
//! Financial statements come in families that are always fetched together.
//! Packing them keeps the per-symbol file count bounded; a unit is rewritten
//! whole whenever any member changes.

const PACKS: &[(&str, &[&str])] = &[
    (
        "quarterlys",
        &[
            "quarterly_balance_sheet",
            "quarterly_cashflow",
            "quarterly_earnings",
            "quarterly_financials",
        ],
    ),
    (
        "annuals",
        &["balance_sheet", "cashflow", "earnings", "financials"],
    ),
];

/// The unit a record name is packed into, if any.
pub fn unit_for(name: &str) -> Option<&'static str> {
    PACKS
        .iter()
        .find(|(_, members)| members.contains(&name))
        .map(|(unit, _)| *unit)
}

/// The static name of a unit, if `name` is one.
pub fn unit_named(name: &str) -> Option<&'static str> {
    PACKS.iter().map(|(unit, _)| *unit).find(|unit| *unit == name)
}

/// Unit names are reserved: a standalone record may not shadow one.
pub fn is_unit(name: &str) -> bool {
    unit_named(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_route_to_units() {
        assert_eq!(unit_for("quarterly_cashflow"), Some("quarterlys"));
        assert_eq!(unit_for("financials"), Some("annuals"));
        assert_eq!(unit_for("info"), None);
        assert_eq!(unit_for("history-1d"), None);
    }

    #[test]
    fn units_are_reserved() {
        assert!(is_unit("annuals"));
        assert!(!is_unit("cashflow"));
        assert_eq!(unit_named("quarterlys"), Some("quarterlys"));
        assert_eq!(unit_named("nope"), None);
    }
}
