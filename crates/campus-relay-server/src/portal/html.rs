//! Minimal HTML extraction for the portal's server-rendered pages.
//!
//! The portal renders data as plain `<table>` grids and login forms with
//! hidden state inputs. These helpers only understand that much.

use std::sync::LazyLock;

use regex::Regex;

static ROW_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tr\b[^>]*>(.*?)</tr>").expect("Invalid row regex"));

static CELL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<td\b[^>]*>(.*?)</td>").expect("Invalid cell regex"));

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("Invalid tag regex"));

static INPUT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<input\b[^>]*>").expect("Invalid input regex"));

static ATTR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\b([a-z_:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("Invalid attr regex")
});

/// Data rows of the table with the given `id`, one `Vec` of cell texts per row.
///
/// Rows without `<td>` cells (header rows made of `<th>`) are left out.
/// `None` when the table is not on the page.
pub fn table_rows(html: &str, table_id: &str) -> Option<Vec<Vec<String>>> {
    let pattern = format!(
        r#"(?is)<table\b[^>]*\bid\s*=\s*["']{}["'][^>]*>(.*?)</table>"#,
        regex::escape(table_id)
    );
    let table = Regex::new(&pattern).ok()?.captures(html)?.get(1)?.as_str();

    let rows = ROW_REGEX
        .captures_iter(table)
        .filter_map(|row| row.get(1))
        .map(|row| {
            CELL_REGEX
                .captures_iter(row.as_str())
                .filter_map(|cell| cell.get(1))
                .map(|cell| cell_text(cell.as_str()))
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect();
    Some(rows)
}

/// `(name, value)` of every hidden input, in document order.
pub fn hidden_inputs(html: &str) -> Vec<(String, String)> {
    INPUT_REGEX
        .find_iter(html)
        .filter_map(|input| {
            let mut name = None;
            let mut value = String::new();
            let mut hidden = false;
            for attr in ATTR_REGEX.captures_iter(input.as_str()) {
                let key = attr.get(1).map(|m| m.as_str().to_ascii_lowercase());
                let val = attr
                    .get(2)
                    .or_else(|| attr.get(3))
                    .map(|m| decode_entities(m.as_str()))
                    .unwrap_or_default();
                match key.as_deref() {
                    Some("type") => hidden = val.eq_ignore_ascii_case("hidden"),
                    Some("name") => name = Some(val),
                    Some("value") => value = val,
                    _ => {}
                }
            }
            match (hidden, name) {
                (true, Some(name)) => Some((name, value)),
                _ => None,
            }
        })
        .collect()
}

fn cell_text(raw: &str) -> String {
    decode_entities(&TAG_REGEX.replace_all(raw, " "))
        .trim()
        .to_string()
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <table id="other"><tr><td>ignore</td></tr></table>
        <table class="grid" id="PDGcourpercView" border="1">
            <tr><th>Course</th><th>Total</th></tr>
            <tr><td>20XT61&nbsp;-&nbsp;Data <b>Mining</b></td><td> 40 </td></tr>
            <tr class="alt"><td>20XT62 - R &amp; D</td><td>38</td></tr>
        </table>
        </body></html>
    "#;

    #[test]
    fn extracts_rows_of_the_named_table() {
        let rows = table_rows(PAGE, "PDGcourpercView").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["20XT61 - Data  Mining", "40"]);
        assert_eq!(rows[1][0], "20XT62 - R & D");
    }

    #[test]
    fn missing_table_is_none() {
        assert!(table_rows(PAGE, "DgResult").is_none());
        assert_eq!(table_rows(PAGE, "other").unwrap(), vec![vec!["ignore".to_string()]]);
    }

    #[test]
    fn hidden_inputs_in_order() {
        let form = r#"
            <form method="post">
              <input type="hidden" name="__VIEWSTATE" value="abc&amp;def" />
              <input name="__EVENTVALIDATION" type='hidden' value='xyz'>
              <input type="text" name="rollno" value="">
              <input type="hidden" value="orphan">
            </form>
        "#;
        assert_eq!(
            hidden_inputs(form),
            vec![
                ("__VIEWSTATE".to_string(), "abc&def".to_string()),
                ("__EVENTVALIDATION".to_string(), "xyz".to_string()),
            ]
        );
    }
}
