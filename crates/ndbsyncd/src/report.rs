//! Re-runnable, lazily evaluated query results

use crate::error::Result;
use crate::types::{Record, Value, record_to_string};
use std::fmt;
use std::sync::Arc;

/// Lines shown by a report's textual preview before it is elided
pub const MAX_REPORT_LINES: usize = 100;

/// One pass over a report
pub type Rows<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

type Factory<T> = dyn Fn() -> Rows<T> + Send + Sync;

/// Wrapper around a query that runs again for every pass
///
/// A failing query shows up as an `Err` item where the rows would have
/// started, so a consumer sees the sequence end with the error instead of
/// silently stopping short.
pub struct Report<T> {
    factory: Arc<Factory<T>>,
}

impl<T> Clone for Report<T> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
        }
    }
}

impl<T: 'static> Report<T> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Rows<T> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
        }
    }

    /// Start a fresh pass
    pub fn iter(&self) -> Rows<T> {
        (self.factory)()
    }

    /// Number of items, header included; consumes one full pass
    pub fn len(&self) -> Result<usize> {
        let mut count = 0;
        for item in self.iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        match self.iter().next() {
            None => Ok(true),
            Some(item) => item.map(|_| false),
        }
    }

    /// Collect one pass
    pub fn records(&self) -> Result<Vec<T>> {
        self.iter().collect()
    }
}

impl Report<Record> {
    /// Render every record as one comma-separated line
    ///
    /// Integers are written bare, nulls as empty fields and anything else
    /// single-quoted.
    pub fn csv(&self) -> Report<String> {
        let inner = self.clone();
        Report::new(move || Box::new(inner.iter().map(|row| row.map(|r| csv_line(&r)))))
    }
}

/// One record as a CSV line
pub fn csv_line(record: &[Value]) -> String {
    record
        .iter()
        .map(Value::to_csv)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a line produced by [`csv_line`] back into values
///
/// Commas inside a quoted field stay in that field and a doubled quote
/// stands for one quote character.
pub fn parse_csv_line(line: &str) -> Record {
    let mut record = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in line.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            ',' if !quoted => {
                record.push(parse_csv_field(&line[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }
    record.push(parse_csv_field(&line[start..]));
    record
}

fn parse_csv_field(field: &str) -> Value {
    if field.is_empty() {
        Value::Null
    } else if let Some(text) = field
        .strip_prefix('\'')
        .and_then(|f| f.strip_suffix('\''))
    {
        Value::Text(text.replace("''", "'"))
    } else if let Ok(i) = field.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(r) = field.parse::<f64>() {
        Value::Real(r)
    } else {
        Value::Text(field.to_string())
    }
}

/// How an item is shown in a report preview
pub trait ReportLine {
    fn render(&self) -> String;
}

impl ReportLine for Record {
    fn render(&self) -> String {
        record_to_string(self)
    }
}

impl ReportLine for String {
    fn render(&self) -> String {
        self.clone()
    }
}

impl<T: ReportLine + 'static> fmt::Display for Report<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rows = self.iter();
        for _ in 0..MAX_REPORT_LINES {
            match rows.next() {
                Some(Ok(item)) => writeln!(f, "{}", item.render())?,
                Some(Err(e)) => return writeln!(f, "error: {}", e),
                None => return Ok(()),
            }
        }
        if rows.next().is_some() {
            writeln!(f, "(...)")?;
        }
        Ok(())
    }
}

impl<T> fmt::Debug for Report<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Report").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NdbError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn numbers(n: i64) -> Report<Record> {
        Report::new(move || Box::new((0..n).map(|i| Ok(vec![Value::Integer(i), Value::from("x")]))))
    }

    #[test]
    fn test_every_pass_reruns_the_source() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let report: Report<Record> = Report::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(std::iter::once(Ok(vec![Value::Null])))
        });
        assert_eq!(report.len().unwrap(), 1);
        assert_eq!(report.records().unwrap().len(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_preview_is_bounded() {
        let text = numbers(150).to_string();
        assert_eq!(text.lines().count(), MAX_REPORT_LINES + 1);
        assert_eq!(text.lines().last(), Some("(...)"));

        let short = numbers(2).to_string();
        assert_eq!(short, "(0, 'x')\n(1, 'x')\n");
    }

    #[test]
    fn test_errors_end_the_sequence() {
        let report: Report<Record> = Report::new(|| {
            Box::new(
                vec![Ok(vec![Value::from("hdr")]), Err(NdbError::Closed)].into_iter(),
            )
        });
        assert!(matches!(report.len(), Err(NdbError::Closed)));
        assert!(report.to_string().ends_with("error: Database closed\n"));
    }

    #[test]
    fn test_csv_rendering() {
        let report: Report<Record> = Report::new(|| {
            Box::new(std::iter::once(Ok(vec![
                Value::from("h1"),
                Value::Integer(2),
                Value::Null,
                Value::from("up"),
            ])))
        });
        assert_eq!(report.csv().records().unwrap(), vec!["'h1',2,,'up'"]);
        assert_eq!(
            parse_csv_line("'h1',2,,'up'"),
            vec![Value::from("h1"), Value::Integer(2), Value::Null, Value::from("up")]
        );
    }

    #[test]
    fn test_csv_quoted_separators() {
        let row = vec![
            Value::from("a,b"),
            Value::from("it's"),
            Value::from(""),
            Value::Null,
            Value::Integer(7),
        ];
        let line = csv_line(&row);
        assert_eq!(line, "'a,b','it''s','',,7");
        assert_eq!(parse_csv_line(&line), row);
    }
}
