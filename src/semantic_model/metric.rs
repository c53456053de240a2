use super::duration;
use super::model::Column;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub name: String,
    pub base_object: String,
    #[serde(default)]
    pub dimension: Vec<Column>,
    #[serde(default)]
    pub measure: Vec<Column>,
    #[serde(default)]
    pub time_grain: Vec<TimeGrain>,
    #[serde(default)]
    pub pre_aggregated: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration::option"
    )]
    pub refresh_time: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Metric {
    pub fn new(
        name: impl Into<String>,
        base_object: impl Into<String>,
        dimension: Vec<Column>,
        measure: Vec<Column>,
    ) -> Self {
        Metric {
            name: name.into(),
            base_object: base_object.into(),
            dimension,
            measure,
            time_grain: vec![],
            pre_aggregated: false,
            refresh_time: None,
            description: None,
        }
    }

    pub fn with_time_grain(mut self, time_grain: TimeGrain) -> Self {
        self.time_grain.push(time_grain);
        self
    }

    pub fn with_pre_aggregation(mut self, refresh_time: Option<Duration>) -> Self {
        self.pre_aggregated = true;
        self.refresh_time = refresh_time;
        self
    }

    /// Dimensions first, then measures.
    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.dimension.iter().chain(self.measure.iter())
    }

    pub fn get_time_grain(&self, name: &str) -> Option<&TimeGrain> {
        self.time_grain.iter().find(|grain| grain.name == name)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimeGrain {
    pub name: String,
    pub ref_column: String,
    #[serde(default)]
    pub date_parts: Vec<TimeUnit>,
}

impl TimeGrain {
    pub fn new(name: impl Into<String>, ref_column: impl Into<String>, date_parts: Vec<TimeUnit>) -> Self {
        TimeGrain {
            name: name.into(),
            ref_column: ref_column.into(),
            date_parts,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    Year,
    Quarter,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
}

impl TimeUnit {
    /// Unit name accepted by `DATE_TRUNC`.
    pub fn as_date_trunc_unit(&self) -> &'static str {
        match self {
            TimeUnit::Year => "year",
            TimeUnit::Quarter => "quarter",
            TimeUnit::Month => "month",
            TimeUnit::Week => "week",
            TimeUnit::Day => "day",
            TimeUnit::Hour => "hour",
            TimeUnit::Minute => "minute",
            TimeUnit::Second => "second",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_date_trunc_unit().to_uppercase())
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "year" => Ok(TimeUnit::Year),
            "quarter" => Ok(TimeUnit::Quarter),
            "month" => Ok(TimeUnit::Month),
            "week" => Ok(TimeUnit::Week),
            "day" => Ok(TimeUnit::Day),
            "hour" => Ok(TimeUnit::Hour),
            "minute" => Ok(TimeUnit::Minute),
            "second" => Ok(TimeUnit::Second),
            _ => Err(format!("Unknown time unit: {}", s)),
        }
    }
}

/// A running aggregate of one measure along a time window.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeMetric {
    pub name: String,
    pub base_object: String,
    pub measure: Measure,
    pub window: Window,
    #[serde(default)]
    pub pre_aggregated: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration::option"
    )]
    pub refresh_time: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl CumulativeMetric {
    pub fn new(
        name: impl Into<String>,
        base_object: impl Into<String>,
        measure: Measure,
        window: Window,
    ) -> Self {
        CumulativeMetric {
            name: name.into(),
            base_object: base_object.into(),
            measure,
            window,
            pre_aggregated: false,
            refresh_time: None,
            description: None,
        }
    }

    pub fn with_pre_aggregation(mut self, refresh_time: Option<Duration>) -> Self {
        self.pre_aggregated = true;
        self.refresh_time = refresh_time;
        self
    }

    /// Output column names: the window column followed by the measure.
    pub fn column_names(&self) -> [&str; 2] {
        [self.window.name.as_str(), self.measure.name.as_str()]
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Measure {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub operator: String,
    pub ref_column: String,
}

impl Measure {
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        operator: impl Into<String>,
        ref_column: impl Into<String>,
    ) -> Self {
        Measure {
            name: name.into(),
            type_name: type_name.into(),
            operator: operator.into(),
            ref_column: ref_column.into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub name: String,
    pub ref_column: String,
    pub time_unit: TimeUnit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
}

impl Window {
    pub fn new(name: impl Into<String>, ref_column: impl Into<String>, time_unit: TimeUnit) -> Self {
        Window {
            name: name.into(),
            ref_column: ref_column.into(),
            time_unit,
            start: None,
            end: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_from_str() {
        assert_eq!(TimeUnit::from_str("month").unwrap(), TimeUnit::Month);
        assert_eq!(TimeUnit::from_str("YEAR").unwrap(), TimeUnit::Year);
        assert!(TimeUnit::from_str("fortnight").is_err());
    }

    #[test]
    fn test_metric_columns_order() {
        let metric = Metric::new(
            "Collection",
            "Album",
            vec![Column::new("author", "varchar")],
            vec![Column::new("price", "integer").with_expression("sum(Album.price)")],
        );
        let names: Vec<&str> = metric.columns().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["author", "price"]);
    }
}
