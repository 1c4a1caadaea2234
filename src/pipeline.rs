use crate::cache::PredictionCache;
use crate::characteristics::{aggregate, CharacteristicsRecord, RecordIdentity};
use crate::classification::{classify, ClassifiedSeries, Classifier};
use crate::config::PipelineConfig;
use crate::data_loading::{discover_days, discover_subjects, read_recording, DayEntry, SubjectEntry};
use crate::diagnostics::{Channel, Diagnostics};
use crate::epochs::split;
use crate::error::UnitError;
use crate::output::{ResultTable, Track};
use crate::pain::{annotate, epoch_day, epoch_time_of_day, PainTable};
use crate::preprocessing::{clean, CleanedStream};
use crate::Recording;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::path::Path;

/// Records produced for one subject-day.
#[derive(Debug, Clone)]
pub struct DayResult {
    pub day_record: CharacteristicsRecord,
    pub epoch_records: Vec<CharacteristicsRecord>,
}

/// Outcome of one unit of work. `day` is `None` for subject-level failures.
#[derive(Debug)]
pub struct UnitReport {
    pub subject: String,
    pub day: Option<String>,
    pub outcome: Result<DayResult, UnitError>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub units: Vec<UnitReport>,
    /// Subject-level notes that did not stop processing
    pub subject_diagnostics: Diagnostics,
}

impl RunReport {
    /// Day and epoch tables of every successful unit, sorted.
    pub fn tables(&self, decimals: u32) -> (ResultTable, ResultTable) {
        let mut days = ResultTable::new(Track::Day, decimals);
        let mut epochs = ResultTable::new(Track::Epoch, decimals);
        for result in self.units.iter().filter_map(|u| u.outcome.as_ref().ok()) {
            days.append(result.day_record.clone());
            for record in &result.epoch_records {
                epochs.append(record.clone());
            }
        }
        days.finalize();
        epochs.finalize();
        (days, epochs)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let mut all = self.subject_diagnostics.clone();
        for unit in &self.units {
            all.merge(unit.diagnostics.clone());
        }
        all
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| u.outcome.is_err())
    }

    pub fn successes(&self) -> usize {
        self.units.iter().filter(|u| u.outcome.is_ok()).count()
    }
}

struct WorkItem<'s> {
    subject: &'s SubjectEntry,
    day: DayEntry,
    pain: &'s PainTable,
}

pub struct Pipeline<'m> {
    config: PipelineConfig,
    model: &'m dyn Classifier,
    cache: Option<PredictionCache>,
}

impl<'m> Pipeline<'m> {
    pub fn new(config: PipelineConfig, model: &'m dyn Classifier) -> Self {
        Self {
            config,
            model,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: PredictionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Processes every subject-day below `raw_dir` in parallel. Only a
    /// missing or unreadable `raw_dir` fails the run.
    pub fn run(&self, raw_dir: &Path) -> Result<RunReport> {
        let subjects = discover_subjects(raw_dir)
            .with_context(|| format!("Failed to list subjects in {}", raw_dir.display()))?;
        info!("Found {} subjects in {}", subjects.len(), raw_dir.display());

        let mut report = RunReport::default();
        let mut prepared = Vec::new();
        for subject in &subjects {
            let mut diagnostics = Diagnostics::for_unit(&subject.id, None);
            match self.prepare_subject(subject, &mut diagnostics) {
                Ok((pain, days)) => {
                    report.subject_diagnostics.merge(diagnostics);
                    prepared.push((subject, pain, days));
                }
                Err(err) => {
                    diagnostics.error(Channel::Processing, err.to_string());
                    report.units.push(UnitReport {
                        subject: subject.id.clone(),
                        day: None,
                        outcome: Err(err),
                        diagnostics,
                    });
                }
            }
        }

        let work: Vec<WorkItem> = prepared
            .iter()
            .flat_map(|(subject, pain, days)| {
                days.iter().map(move |day| WorkItem {
                    subject,
                    day: day.clone(),
                    pain,
                })
            })
            .collect();

        info!("Processing {} subject-days", work.len());
        let processed: Vec<UnitReport> = work
            .par_iter()
            .map(|item| {
                let mut diagnostics = Diagnostics::for_unit(&item.subject.id, Some(&item.day.id));
                let outcome = self.process_day(&item.subject.id, &item.day, item.pain, &mut diagnostics);
                if let Err(err) = &outcome {
                    diagnostics.error(Channel::Processing, err.to_string());
                }
                UnitReport {
                    subject: item.subject.id.clone(),
                    day: Some(item.day.id.clone()),
                    outcome,
                    diagnostics,
                }
            })
            .collect();

        report.units.extend(processed);
        report
            .units
            .sort_by(|a, b| (&a.subject, &a.day).cmp(&(&b.subject, &b.day)));
        info!(
            "Processed {} units, {} failed",
            report.units.len(),
            report.failures().count()
        );
        Ok(report)
    }

    /// Loads the pain table and lists the day directories of one subject.
    fn prepare_subject(
        &self,
        subject: &SubjectEntry,
        diagnostics: &mut Diagnostics,
    ) -> Result<(PainTable, Vec<DayEntry>), UnitError> {
        let days = discover_days(subject).map_err(|e| UnitError::input(&e))?;
        let pain = match PainTable::load(&subject.pain_score_path()) {
            Ok(table) => table,
            Err(err) if !self.config.require_pain_scores => {
                diagnostics.warn(
                    Channel::Pain,
                    format!("continuing without pain scores: {:#}", err),
                );
                PainTable::default()
            }
            Err(err) => return Err(UnitError::input(&err)),
        };
        debug!(
            "{}: {} days, {} pain scores",
            subject.id,
            days.len(),
            pain.len()
        );
        Ok((pain, days))
    }

    /// Reads and processes one day directory.
    pub fn process_day(
        &self,
        subject: &str,
        day: &DayEntry,
        pain: &PainTable,
        diagnostics: &mut Diagnostics,
    ) -> Result<DayResult, UnitError> {
        let path = day.recording.as_ref().ok_or_else(|| {
            UnitError::Input(format!("no recording found in {}", day.path.display()))
        })?;
        let stream = read_recording(path).map_err(|e| UnitError::input(&e))?;
        let recording = Recording::new(stream, self.config.sample_period())
            .ok_or_else(|| UnitError::EmptyRecording(path.display().to_string()))?;
        Ok(self.process_recording(subject, &day.id, &recording, pain, diagnostics))
    }

    /// Day record plus one record per epoch. Never fails: unscorable chunks
    /// and missing pain scores only leave diagnostics.
    pub fn process_recording(
        &self,
        subject: &str,
        day: &str,
        recording: &Recording,
        pain: &PainTable,
        diagnostics: &mut Diagnostics,
    ) -> DayResult {
        debug!(
            "{} {}: {} samples from {} to {}",
            subject,
            day,
            recording.stream.len(),
            recording.begin_time,
            recording.end_time
        );
        let cleaned = clean(&recording.stream, &self.config);
        if cleaned.is_empty() {
            diagnostics.warn(Channel::Processing, "no worn samples");
        }
        let series = self.day_series(subject, day, &cleaned, diagnostics);

        let identity = RecordIdentity {
            subject: subject.to_string(),
            day: day.to_string(),
            samples: cleaned.total_samples,
            not_worn_samples: cleaned.not_worn_count,
            name: recording.stream.source.clone(),
            begin_time: recording.begin_time,
            end_time: recording.end_time,
            key: None,
        };
        let mut day_record = aggregate(identity, &series);
        if let Err(err) = annotate(pain, &mut day_record, day, None) {
            diagnostics.error(Channel::Pain, err.to_string());
        }

        let epochs = split(
            &recording.stream,
            recording.begin_time,
            recording.end_time,
            &self.config,
        );
        let mut epoch_records = Vec::with_capacity(epochs.len());
        for epoch in epochs.values() {
            let cleaned = clean(&epoch.stream, &self.config);
            let series = classify(
                &cleaned.stream,
                &self.config,
                self.config.chunk_size,
                self.model,
                diagnostics,
            );
            let identity = RecordIdentity {
                subject: subject.to_string(),
                day: day.to_string(),
                samples: cleaned.total_samples,
                not_worn_samples: cleaned.not_worn_count,
                name: recording.stream.source.clone(),
                begin_time: epoch.start,
                end_time: epoch.end,
                key: Some(epoch.key.label().to_string()),
            };
            let mut record = aggregate(identity, &series);

            let pain_day = epoch_day(day, recording.begin_time, epoch.start);
            let annotated = epoch_time_of_day(epoch.key.label())
                .and_then(|time| annotate(pain, &mut record, &pain_day, Some(&time)));
            if let Err(err) = annotated {
                diagnostics.error(Channel::Pain, format!("{}: {}", epoch.key, err));
            }
            epoch_records.push(record);
        }

        DayResult {
            day_record,
            epoch_records,
        }
    }

    /// Classified series of the whole day, from the cache when possible.
    fn day_series(
        &self,
        subject: &str,
        day: &str,
        cleaned: &CleanedStream,
        diagnostics: &mut Diagnostics,
    ) -> ClassifiedSeries {
        let settings = self.config.prediction_settings();
        if let Some(series) = self
            .cache
            .as_ref()
            .and_then(|cache| cache.load(subject, day, self.model.version(), &settings))
        {
            return series;
        }

        let series = classify(
            &cleaned.stream,
            &self.config,
            self.config.chunk_size,
            self.model,
            diagnostics,
        );
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.store(subject, day, &series, &settings) {
                warn!("Failed to cache predictions for {} {}: {:#}", subject, day, err);
            }
        }
        series
    }
}
