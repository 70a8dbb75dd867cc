use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AudioFilterConfig {
    pub reverb: EffectConfig,
    pub pitch: EffectConfig,
    pub speed: EffectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectConfig {
    pub enabled: bool,
    pub random_enabled: bool,
    /// reverb: 0..100 (percent); pitch: semitones -12..12; speed: multiplier 0.25..4.0.
    pub amount: f32,
    pub random_range_min: f32,
    pub random_range_max: f32,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            random_enabled: true,
            amount: 0.0,
            random_range_min: 0.0,
            random_range_max: 0.0,
        }
    }
}

/// Invokes `ffmpeg`/`ffprobe` to apply a fixed effect chain {reverb, pitch, speed} to
/// a synth output file. Not fatal on absence or failure: the original file and a
/// null duration are returned instead.
pub struct AudioFilterProcessor {
    ffmpeg_available: bool,
}

impl AudioFilterProcessor {
    pub async fn detect() -> Self {
        let available = Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false);
        if !available {
            log::warn!("ffmpeg not found - audio filters will be disabled");
        }
        Self { ffmpeg_available: available }
    }

    pub fn is_available(&self) -> bool {
        self.ffmpeg_available
    }

    /// Applies filters to `input_path`, returning the (possibly unchanged) path and
    /// probed duration. `random_filters` selects the random mode from §4.5.
    pub async fn apply_filters(
        &self,
        input_path: &Path,
        config: &AudioFilterConfig,
        random_filters: bool,
    ) -> (PathBuf, Option<f32>) {
        if !self.ffmpeg_available {
            return (input_path.to_path_buf(), None);
        }

        let chain = if random_filters {
            build_random_filters(config)
        } else {
            build_deterministic_filters(config)
        };

        if chain.is_empty() {
            return (input_path.to_path_buf(), None);
        }

        let filter_complex = chain.join(",");
        let output_path = sibling_filtered_path(input_path);

        let status = Command::new("ffmpeg")
            .arg("-i")
            .arg(input_path)
            .arg("-af")
            .arg(&filter_complex)
            .arg("-y")
            .arg(&output_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        let status = match tokio::time::timeout(Duration::from_secs(30), status).await {
            Ok(Ok(status)) if status.success() => status,
            Ok(Ok(status)) => {
                log::error!("ffmpeg exited with {}", status);
                return (input_path.to_path_buf(), None);
            }
            Ok(Err(e)) => {
                log::error!("failed to invoke ffmpeg: {}", e);
                return (input_path.to_path_buf(), None);
            }
            Err(_) => {
                log::error!("ffmpeg timed out while applying filters");
                return (input_path.to_path_buf(), None);
            }
        };
        let _ = status;

        let duration = probe_duration(&output_path).await;

        if let Err(e) = tokio::fs::remove_file(input_path).await {
            log::warn!("failed to delete original audio file {}: {}", input_path.display(), e);
        }

        (output_path, duration)
    }
}

fn sibling_filtered_path(input_path: &Path) -> PathBuf {
    let stem = input_path.file_stem().and_then(|s| s.to_str()).unwrap_or("audio");
    let ext = input_path.extension().and_then(|e| e.to_str()).unwrap_or("mp3");
    input_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{}_filtered.{}", stem, ext))
}

async fn probe_duration(path: &Path) -> Option<f32> {
    let output = tokio::time::timeout(
        Duration::from_secs(10),
        Command::new("ffprobe")
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(path)
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse::<f32>().ok()
}

fn reverb_filter(amount: f32) -> String {
    format!("aecho=0.8:0.88:60:0.4,volume={}", 1.0 + amount * 0.3)
}

fn pitch_filter(semitones: f32) -> String {
    format!("asetrate=44100*pow(2\\,{}/12),aresample=44100", semitones)
}

fn speed_filter(multiplier: f32) -> String {
    if (0.5..=2.0).contains(&multiplier) {
        format!("atempo={}", multiplier)
    } else if multiplier < 0.5 {
        format!("atempo=0.5,atempo={}", multiplier / 0.5)
    } else {
        format!("atempo=2.0,atempo={}", multiplier / 2.0)
    }
}

fn build_deterministic_filters(config: &AudioFilterConfig) -> Vec<String> {
    let mut filters = Vec::new();
    if config.reverb.enabled {
        filters.push(reverb_filter((config.reverb.amount / 100.0).clamp(0.0, 1.0)));
    }
    if config.pitch.enabled && config.pitch.amount != 0.0 {
        filters.push(pitch_filter(config.pitch.amount.clamp(-12.0, 12.0)));
    }
    if config.speed.enabled && config.speed.amount != 1.0 && config.speed.amount > 0.0 {
        filters.push(speed_filter(config.speed.amount.clamp(0.25, 4.0)));
    }
    filters
}

fn build_random_filters(config: &AudioFilterConfig) -> Vec<String> {
    let mut rng = rand::thread_rng();
    let mut available: Vec<&'static str> = Vec::new();
    if config.reverb.random_enabled {
        available.push("reverb");
    }
    if config.pitch.random_enabled {
        available.push("pitch");
    }
    if config.speed.random_enabled {
        available.push("speed");
    }
    if available.is_empty() {
        log::warn!("no effects enabled for random mode");
        return Vec::new();
    }

    let num_filters = rng.gen_range(1..=available.len().min(3));
    let mut pool = available.clone();
    let mut selected = Vec::new();
    for _ in 0..num_filters {
        if pool.is_empty() {
            break;
        }
        let idx = rng.gen_range(0..pool.len());
        selected.push(pool.remove(idx));
    }

    let mut filters = Vec::new();
    for kind in selected {
        match kind {
            "reverb" => {
                let (min, max) = range_or_default(config.reverb.random_range_min, config.reverb.random_range_max, 20.0, 80.0);
                let amount = rng.gen_range(min / 100.0..=max / 100.0);
                filters.push(reverb_filter(amount));
            }
            "pitch" => {
                let (min, max) = range_or_default(config.pitch.random_range_min, config.pitch.random_range_max, -8.0, 8.0);
                let candidates: Vec<i32> = ((min as i32)..=(max as i32)).filter(|s| s.abs() > 1).collect();
                if let Some(&semitones) = candidates.get(rng.gen_range(0..candidates.len().max(1))) {
                    filters.push(pitch_filter(semitones as f32));
                }
            }
            "speed" => {
                let (min, max) = range_or_default(config.speed.random_range_min, config.speed.random_range_max, 0.75, 1.3);
                let mut options = Vec::new();
                let mut current = min;
                while current <= max {
                    if current < 0.95 || current > 1.05 {
                        options.push((current * 100.0).round() / 100.0);
                    }
                    current += 0.05;
                }
                if let Some(&speed) = options.get(rng.gen_range(0..options.len().max(1))) {
                    filters.push(speed_filter(speed));
                }
            }
            _ => unreachable!(),
        }
    }
    filters
}

fn range_or_default(min: f32, max: f32, default_min: f32, default_max: f32) -> (f32, f32) {
    if min == 0.0 && max == 0.0 {
        (default_min, default_max)
    } else {
        (min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_within_atempo_range_is_single_stage() {
        assert_eq!(speed_filter(1.5), "atempo=1.5");
    }

    #[test]
    fn speed_below_half_chains_two_stages() {
        assert_eq!(speed_filter(0.3), "atempo=0.5,atempo=0.6");
    }

    #[test]
    fn speed_above_double_chains_two_stages() {
        assert_eq!(speed_filter(3.0), "atempo=2.0,atempo=1.5");
    }

    #[test]
    fn reverb_gain_scales_with_amount() {
        assert_eq!(reverb_filter(0.5), "aecho=0.8:0.88:60:0.4,volume=1.15");
    }

    #[test]
    fn deterministic_chain_skips_disabled_effects() {
        let config = AudioFilterConfig::default();
        let chain = build_deterministic_filters(&config);
        assert!(chain.is_empty());
    }

    #[test]
    fn random_chain_is_empty_when_nothing_randomizable() {
        let mut config = AudioFilterConfig::default();
        config.reverb.random_enabled = false;
        config.pitch.random_enabled = false;
        config.speed.random_enabled = false;
        assert!(build_random_filters(&config).is_empty());
    }

    #[test]
    fn sibling_filtered_path_keeps_extension() {
        let path = Path::new("/audio/abc.mp3");
        assert_eq!(sibling_filtered_path(path), PathBuf::from("/audio/abc_filtered.mp3"));
    }
}
