use itertools::Itertools as _;

pub const NOTICE: &str = "NOTICE: These figures are estimated based on job data as of the previous 24 hours\n        \
                          Final billing calculations are done by the billing team at the end of each cycle";

/// Two-column ASCII table with a header row.
///
/// ```text
/// +------------------------+-----------+
/// | Estimated Usage Report | Value     |
/// +------------------------+-----------+
/// | User                   | alice     |
/// +------------------------+-----------+
/// ```
pub fn table(title: &str, rows: &[(&str, String)]) -> String {
    let name_width = column_width(rows.iter().map(|(name, _)| *name).chain([title]));
    let value_width = column_width(rows.iter().map(|(_, value)| value.as_str()).chain(["Value"]));

    let separator = format!("+{}+{}+", "-".repeat(name_width + 2), "-".repeat(value_width + 2));
    let row = |name: &str, value: &str| format!("| {name:<name_width$} | {value:<value_width$} |");

    [separator.clone(), row(title, "Value"), separator.clone()]
        .into_iter()
        .chain(rows.iter().map(|(name, value)| row(name, value)))
        .chain([separator])
        .join("\n")
}

fn column_width<'a>(cells: impl Iterator<Item = &'a str>) -> usize {
    cells.map(|cell| cell.chars().count()).max().unwrap_or(0)
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table__aligned_columns() {
        let rows = [("User", "alice".to_owned()), ("Total GPU Hours", "2.500".to_owned())];
        let expected = "\
+-----------------+-------+
| Report          | Value |
+-----------------+-------+
| User            | alice |
| Total GPU Hours | 2.500 |
+-----------------+-------+";
        assert_eq!(table("Report", &rows), expected);
    }

    #[test]
    fn table__title_wider_than_rows() {
        let rendered = table("Estimated Usage Report", &[("User", "bob".to_owned())]);
        let lines = rendered.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 5);
        assert!(lines.iter().map(|line| line.chars().count()).all_equal());
        assert_eq!(lines[3], "| User                   | bob   |");
    }

    #[test]
    fn table__empty() {
        assert_eq!(table("T", &[]).lines().count(), 4);
    }
}
