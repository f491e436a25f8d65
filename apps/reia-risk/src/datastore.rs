use crate::error::{Result, RiskError};
use crate::model::RiskType;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;

/// Run parameters the engine stores next to its results.
#[derive(Debug, Clone, Deserialize)]
pub struct RunParams {
    pub calculation_mode: String,
    pub number_of_ground_motion_fields: u64,
    /// Groups of aggregation dimensions, e.g. `[["Canton", "CantonGemeinde"]]`.
    #[serde(default)]
    pub aggregate_by: Vec<Vec<String>>,
    /// Loss-type names indexed by `loss_id`; only older engine versions
    /// need this.
    #[serde(default)]
    pub loss_types: Option<Vec<String>>,
}

impl RunParams {
    pub fn risk_type(&self) -> Result<RiskType> {
        RiskType::from_calculation_mode(&self.calculation_mode)
    }

    /// Flattened aggregation dimensions in first-seen order.
    pub fn aggregation_types(&self) -> Vec<String> {
        let mut types: Vec<String> = Vec::new();
        for group in &self.aggregate_by {
            for name in group {
                if !types.contains(name) {
                    types.push(name.clone());
                }
            }
        }
        types
    }
}

/// A numeric table addressed by column name.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl RawTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self> {
        if let Some((idx, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(RiskError::MalformedResult(format!(
                "row {idx} has {} fields, expected {}",
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|col| col == name)
            .ok_or_else(|| RiskError::MalformedResult(format!("missing column {name:?}")))
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Everything the extractor needs from one finished engine job.
#[derive(Debug, Clone)]
pub struct ResultSnapshot {
    /// Decode table: `agg_id -> tag names`, one per aggregation dimension.
    pub agg_keys: Vec<Vec<String>>,
    pub risk_by_event: RawTable,
    /// Realization weights indexed by `rlz_id`.
    pub weights: Vec<f64>,
    /// `event_id -> rlz_id`
    pub events: HashMap<i64, i64>,
    pub params: RunParams,
}

pub trait ResultSource {
    fn read(&self) -> Result<ResultSnapshot>;
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    id: i64,
    rlz_id: i64,
}

#[derive(Debug, Deserialize)]
struct WeightRecord {
    weight: f64,
}

/// Reads an exported result directory:
/// `agg_keys.csv`, `risk_by_event.csv`, `weights.csv`, `events.csv` and
/// `oqparam.json`.
#[derive(Debug, Clone)]
pub struct CsvResultStore {
    root: PathBuf,
}

impl CsvResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn open(&self, name: &str) -> Result<File> {
        let path = self.root.join(name);
        File::open(&path).map_err(|err| {
            RiskError::MalformedResult(format!("cannot open {}: {err}", path.display()))
        })
    }

    fn read_agg_keys(&self) -> Result<Vec<Vec<String>>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(self.open("agg_keys.csv")?);
        let mut keys = Vec::new();
        for record in reader.records() {
            let record = record?;
            keys.push(record.iter().map(|field| field.trim().to_string()).collect());
        }
        Ok(keys)
    }

    fn read_risk_by_event(&self) -> Result<RawTable> {
        let mut reader = csv::Reader::from_reader(self.open("risk_by_event.csv")?);
        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|name| name.trim().to_string())
            .collect();
        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let row = record
                .iter()
                .map(|field| {
                    field.trim().parse::<f64>().map_err(|err| {
                        RiskError::MalformedResult(format!(
                            "risk_by_event row {line}: {field:?} is not numeric ({err})"
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }
        RawTable::new(columns, rows)
    }

    fn read_weights(&self) -> Result<Vec<f64>> {
        let mut reader = csv::Reader::from_reader(self.open("weights.csv")?);
        let mut weights = Vec::new();
        for record in reader.deserialize::<WeightRecord>() {
            weights.push(record?.weight);
        }
        Ok(weights)
    }

    fn read_events(&self) -> Result<HashMap<i64, i64>> {
        let mut reader = csv::Reader::from_reader(self.open("events.csv")?);
        let mut events = HashMap::new();
        for record in reader.deserialize::<EventRecord>() {
            let record = record?;
            events.insert(record.id, record.rlz_id);
        }
        Ok(events)
    }

    fn read_params(&self) -> Result<RunParams> {
        let params = serde_json::from_reader(std::io::BufReader::new(self.open("oqparam.json")?))?;
        Ok(params)
    }
}

impl ResultSource for CsvResultStore {
    fn read(&self) -> Result<ResultSnapshot> {
        let snapshot = ResultSnapshot {
            agg_keys: self.read_agg_keys()?,
            risk_by_event: self.read_risk_by_event()?,
            weights: self.read_weights()?,
            events: self.read_events()?,
            params: self.read_params()?,
        };
        tracing::debug!(
            root = %self.root.display(),
            rows = snapshot.risk_by_event.len(),
            agg_keys = snapshot.agg_keys.len(),
            "read result export"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write_export(dir: &Path) {
        fs::write(dir.join("agg_keys.csv"), "GR,GR3911\nZH,ZH0261\n").unwrap();
        fs::write(
            dir.join("risk_by_event.csv"),
            "event_id,agg_id,loss_id,loss,variance\n0,0,4,1200.5,0\n1,1,4,30,0\n1,2,4,1230.5,0\n",
        )
        .unwrap();
        fs::write(dir.join("weights.csv"), "weight\n0.25\n0.75\n").unwrap();
        fs::write(dir.join("events.csv"), "id,rlz_id\n0,0\n1,1\n").unwrap();
        fs::write(
            dir.join("oqparam.json"),
            r#"{"calculation_mode":"scenario_risk","number_of_ground_motion_fields":10,
               "aggregate_by":[["Canton","CantonGemeinde"]]}"#,
        )
        .unwrap();
    }

    #[test]
    fn reads_directory_export() {
        let dir = tempfile::tempdir().unwrap();
        write_export(dir.path());

        let snapshot = CsvResultStore::new(dir.path()).read().unwrap();
        assert_eq!(snapshot.agg_keys[1], vec!["ZH", "ZH0261"]);
        assert_eq!(snapshot.risk_by_event.len(), 3);
        let loss = snapshot.risk_by_event.column_index("loss").unwrap();
        assert_eq!(snapshot.risk_by_event.rows()[0][loss], 1200.5);
        assert_eq!(snapshot.weights, vec![0.25, 0.75]);
        assert_eq!(snapshot.events.get(&1), Some(&1));
        assert_eq!(snapshot.params.risk_type().unwrap(), RiskType::Loss);
        assert_eq!(
            snapshot.params.aggregation_types(),
            vec!["Canton", "CantonGemeinde"]
        );
        assert!(snapshot.params.loss_types.is_none());
    }

    #[test]
    fn missing_file_is_malformed_result() {
        let dir = tempfile::tempdir().unwrap();
        let err = CsvResultStore::new(dir.path()).read().unwrap_err();
        assert!(matches!(err, RiskError::MalformedResult(_)));
    }

    #[test]
    fn non_numeric_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_export(dir.path());
        fs::write(
            dir.path().join("risk_by_event.csv"),
            "event_id,agg_id,loss_id,loss\n0,0,4,lots\n",
        )
        .unwrap();
        let err = CsvResultStore::new(dir.path()).read().unwrap_err();
        assert!(err.to_string().contains("not numeric"));
    }
}
