use grafscrape_core::error::{Result, ScrapeError};
use grafscrape_core::model::dashboard::{Dashboard, Panel};
use regex::Regex;

#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    patterns: Vec<Regex>,
}

impl RowFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| ScrapeError::Config(format!("invalid row pattern {p}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    // Panels above the first row have no title and are matched as "".
    pub fn selects(&self, row: Option<&str>) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|re| re.is_match(row.unwrap_or("")))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectedPanel<'a> {
    pub panel: &'a Panel,
    pub row: Option<&'a str>,
}

pub fn select_panels<'a>(dashboard: &'a Dashboard, rows: &RowFilter) -> Vec<SelectedPanel<'a>> {
    let mut out = Vec::new();
    let mut row: Option<&'a str> = None;
    let mut selected = rows.selects(None);

    for panel in &dashboard.panels {
        if panel.is_row() {
            row = Some(panel.title.as_str());
            selected = rows.selects(row);
            if !selected {
                tracing::debug!(row = %panel.title, "row filtered out");
                continue;
            }
            for nested in &panel.panels {
                push_graph(&mut out, nested, row);
            }
            continue;
        }
        if selected {
            push_graph(&mut out, panel, row);
        }
    }
    out
}

fn push_graph<'a>(out: &mut Vec<SelectedPanel<'a>>, panel: &'a Panel, row: Option<&'a str>) {
    if panel.is_graph() {
        out.push(SelectedPanel { panel, row });
    } else {
        tracing::debug!(panel = %panel.title, kind = %panel.kind, "ignoring non-graph panel");
    }
}
