//! Second order Markov chain for precipitation occurrence.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::core::{Inputs, TaskContext};
use crate::data::{Dataset, SqlType};
use crate::emit::RunOutput;
use crate::engine::Parameterizer;
use crate::registry::TaskDescriptor;
use crate::source::ghcn::GhcnDay;
use crate::stats::{Regression, linregress_through};

use super::regression_info;

crate::record! {
    /// Transition probabilities of one station and calendar month.
    pub struct MarkovRow {
        index: [id, month],
        station: id,
        pub id: String => SqlType::Char(11),
        pub month: u32 => SqlType::SmallInt,
        /// Wet to wet.
        pub p11: f64 => SqlType::Real,
        /// Dry to wet.
        pub p01: f64 => SqlType::Real,
        /// Dry, dry to wet.
        pub p001: f64 => SqlType::Real,
        /// Wet, dry to wet.
        pub p101: f64 => SqlType::Real,
        /// Fraction of wet days.
        pub wetf: f64 => SqlType::Real,
    }
}

/// Year-months needed before a station month gets probabilities.
const MIN_GROUPS: usize = 10;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Counts {
    n: usize,
    nwet: usize,
    ndry: usize,
    np11: usize,
    np01: usize,
    np001: usize,
    np001_denom: usize,
    np101: usize,
    np101_denom: usize,
}

impl Counts {
    /// Counts the transitions of one consecutive daily sequence. Missing
    /// values are neither wet nor dry.
    fn of(prcp: &[f64]) -> Self {
        let wet = |i: usize| prcp[i] > 0.0;
        let dry = |i: usize| prcp[i] == 0.0;
        let known = |i: usize| !prcp[i].is_nan();

        let mut counts = Counts {
            n: prcp.len(),
            ..Default::default()
        };
        for i in 0..prcp.len().saturating_sub(1) {
            counts.nwet += wet(i) as usize;
            counts.ndry += dry(i) as usize;
            counts.np11 += (wet(i) && wet(i + 1)) as usize;
            counts.np01 += (dry(i) && wet(i + 1)) as usize;

            if i + 2 < prcp.len() {
                let dry_dry = dry(i) && dry(i + 1);
                let wet_dry = wet(i) && dry(i + 1);
                counts.np001 += (dry_dry && wet(i + 2)) as usize;
                counts.np001_denom += (dry_dry && known(i + 2)) as usize;
                counts.np101 += (wet_dry && wet(i + 2)) as usize;
                counts.np101_denom += (wet_dry && known(i + 2)) as usize;
            }
        }
        counts
    }

    fn add(mut self, other: Self) -> Self {
        self.n += other.n;
        self.nwet += other.nwet;
        self.ndry += other.ndry;
        self.np11 += other.np11;
        self.np01 += other.np01;
        self.np001 += other.np001;
        self.np001_denom += other.np001_denom;
        self.np101 += other.np101;
        self.np101_denom += other.np101_denom;
        self
    }
}

fn ratio(num: usize, denom: usize) -> f64 {
    if denom == 0 { 0.0 } else { num as f64 / denom as f64 }
}

/// Probabilities per station and calendar month from complete daily data.
pub fn transition_probabilities(days: &Dataset<GhcnDay>) -> Dataset<MarkovRow> {
    let mut months: BTreeMap<(String, u32), Vec<Counts>> = BTreeMap::new();
    for ((id, month, _), mut rows) in days.group_by(|d| (d.id.clone(), d.month, d.year)) {
        rows.sort_by_key(|d| d.day);
        let prcp: Vec<f64> = rows.iter().map(|d| d.prcp).collect();
        months.entry((id, month)).or_default().push(Counts::of(&prcp));
    }

    months
        .into_iter()
        .filter(|(_, groups)| groups.len() > MIN_GROUPS)
        .map(|((id, month), groups)| {
            let c = groups.into_iter().fold(Counts::default(), Counts::add);
            MarkovRow {
                id,
                month,
                p11: ratio(c.np11, c.nwet),
                p01: ratio(c.np01, c.ndry),
                p001: ratio(c.np001, c.np001_denom),
                p101: ratio(c.np101, c.np101_denom),
                wetf: ratio(c.nwet, c.n),
            }
        })
        .collect()
}

pub struct MarkovChain;

impl Parameterizer for MarkovChain {
    type Record = MarkovRow;

    fn descriptor(&self) -> TaskDescriptor {
        TaskDescriptor::new("markov")
            .summary("Calculate the markov probabilities for the stations")
            .requires(["cday"])
            .file("markov.csv")
            .table("markov")
            .with_run_step()
    }

    fn setup(&self, _: &TaskContext<'_>, inputs: &Inputs) -> anyhow::Result<Dataset<MarkovRow>> {
        Ok(transition_probabilities(inputs.get("cday")?))
    }

    fn run(&self, _: &TaskContext<'_>, data: &Dataset<MarkovRow>) -> anyhow::Result<RunOutput> {
        let wetf: Vec<f64> = data.iter().map(|r| r.wetf).collect();
        let fits: [(&str, fn(&MarkovRow) -> f64, (f64, f64)); 3] = [
            ("p11", |r| r.p11, (1.0, 1.0)),
            ("p101", |r| r.p101, (0.0, 0.0)),
            ("p001", |r| r.p001, (0.0, 0.0)),
        ];

        let mut output = RunOutput::default();
        let mut info = Map::new();
        for (name, column, (x0, y0)) in fits {
            let y: Vec<f64> = data.iter().map(column).collect();
            let fit = linregress_through(&wetf, &y, x0, y0).unwrap_or_else(|err| {
                tracing::warn!(task = "markov", "Couldn't fit {name} against wetf: {err}");
                Regression::NAN
            });
            output = output
                .param(format!("{name}_1"), fit.intercept)
                .param(format!("{name}_2"), fit.slope);
            info.insert(name.to_string(), regression_info(&fit));
        }

        Ok(output.info(Value::Object(info)))
    }
}
