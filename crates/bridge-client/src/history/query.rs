use super::{EntryResult, HistoryEntry};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

const TOP_TOOLS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub tool: Option<String>,
    pub result: Option<EntryResult>,
    pub since: Option<SystemTime>,
    pub until: Option<SystemTime>,
    /// Keeps the most recent matches.
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub(crate) fn apply<'a>(&self, entries: &'a [HistoryEntry]) -> Vec<&'a HistoryEntry> {
        let mut matches: Vec<&HistoryEntry> =
            entries.iter().filter(|entry| self.matches(entry)).collect();
        if let Some(limit) = self.limit {
            let skip = matches.len().saturating_sub(limit);
            matches.drain(..skip);
        }
        matches
    }

    fn matches(&self, entry: &HistoryEntry) -> bool {
        if let Some(tool) = self.tool.as_deref() {
            if entry.tool != tool {
                return false;
            }
        }
        if let Some(result) = self.result {
            if entry.result != result {
                return false;
            }
        }
        if self.since.is_none() && self.until.is_none() {
            return true;
        }
        // Entries with an unreadable timestamp never match a range.
        let Some(started) = entry.started_at() else {
            return false;
        };
        self.since.map_or(true, |since| started >= since)
            && self.until.map_or(true, |until| started <= until)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCount {
    pub tool: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total: usize,
    pub by_result: BTreeMap<EntryResult, usize>,
    pub mean_duration_ms: Option<f64>,
    pub top_tools: Vec<ToolCount>,
}

impl HistoryStats {
    pub(crate) fn collect(entries: &[HistoryEntry]) -> Self {
        let mut by_result = BTreeMap::new();
        let mut per_tool: HashMap<&str, usize> = HashMap::new();
        let mut duration_sum = 0u64;
        let mut duration_count = 0u64;
        for entry in entries {
            *by_result.entry(entry.result).or_insert(0) += 1;
            *per_tool.entry(entry.tool.as_str()).or_insert(0) += 1;
            if entry.result != EntryResult::Pending {
                if let Some(duration) = entry.duration {
                    duration_sum += duration;
                    duration_count += 1;
                }
            }
        }

        let mut top_tools: Vec<ToolCount> = per_tool
            .into_iter()
            .map(|(tool, count)| ToolCount {
                tool: tool.to_string(),
                count,
            })
            .collect();
        top_tools.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tool.cmp(&b.tool)));
        top_tools.truncate(TOP_TOOLS);

        Self {
            total: entries.len(),
            by_result,
            mean_duration_ms: (duration_count > 0)
                .then(|| duration_sum as f64 / duration_count as f64),
            top_tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::format_timestamp;
    use serde_json::json;
    use std::time::Duration;

    fn entry(tool: &str, result: EntryResult, at: SystemTime, duration: Option<u64>) -> HistoryEntry {
        HistoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: format_timestamp(at),
            tool: tool.to_string(),
            parameters: json!({}),
            result,
            error: None,
            duration,
            response: None,
            command_id: None,
            host_result: None,
        }
    }

    fn sample() -> (SystemTime, Vec<HistoryEntry>) {
        let base = SystemTime::now() - Duration::from_secs(3600);
        let at = |mins: u64| base + Duration::from_secs(mins * 60);
        let entries = vec![
            entry("createComposition", EntryResult::Success, at(0), Some(100)),
            entry("addLayer", EntryResult::Success, at(10), Some(300)),
            entry("addLayer", EntryResult::Error, at(20), Some(50)),
            entry("render", EntryResult::Pending, at(30), None),
            entry("addLayer", EntryResult::Success, at(40), Some(150)),
        ];
        (base, entries)
    }

    #[test]
    fn filters_by_tool_and_result() {
        let (_, entries) = sample();
        let query = HistoryQuery {
            tool: Some("addLayer".to_string()),
            result: Some(EntryResult::Success),
            ..HistoryQuery::default()
        };
        let found = query.apply(&entries);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|e| e.tool == "addLayer" && e.result == EntryResult::Success));
    }

    #[test]
    fn filters_by_time_range() {
        let (base, entries) = sample();
        let query = HistoryQuery {
            since: Some(base + Duration::from_secs(15 * 60)),
            until: Some(base + Duration::from_secs(35 * 60)),
            ..HistoryQuery::default()
        };
        let tools: Vec<&str> = query.apply(&entries).iter().map(|e| e.tool.as_str()).collect();
        assert_eq!(tools, vec!["addLayer", "render"]);
    }

    #[test]
    fn limit_keeps_the_most_recent() {
        let (_, entries) = sample();
        let query = HistoryQuery {
            limit: Some(2),
            ..HistoryQuery::default()
        };
        let found = query.apply(&entries);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].tool, "render");
        assert_eq!(found[1].tool, "addLayer");
    }

    #[test]
    fn stats_count_results_and_rank_tools() {
        let (_, entries) = sample();
        let stats = HistoryStats::collect(&entries);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.by_result.get(&EntryResult::Success), Some(&3));
        assert_eq!(stats.by_result.get(&EntryResult::Error), Some(&1));
        assert_eq!(stats.by_result.get(&EntryResult::Pending), Some(&1));
        assert_eq!(stats.mean_duration_ms, Some(150.0));
        assert_eq!(
            stats.top_tools[0],
            ToolCount {
                tool: "addLayer".to_string(),
                count: 3
            }
        );
        assert_eq!(stats.top_tools.len(), 3);
    }

    #[test]
    fn stats_on_empty_ledger() {
        let stats = HistoryStats::collect(&[]);
        assert_eq!(stats.total, 0);
        assert!(stats.mean_duration_ms.is_none());
        assert!(stats.top_tools.is_empty());
    }
}
