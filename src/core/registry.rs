//! Step registry - maps a pipeline type to its ordered step list

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    Theme,
    Music,
    Visuals,
    Images,
    Composition,
}

impl StepId {
    pub const ALL: [StepId; 5] = [
        StepId::Theme,
        StepId::Music,
        StepId::Visuals,
        StepId::Images,
        StepId::Composition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepId::Theme => "theme",
            StepId::Music => "music",
            StepId::Visuals => "visuals",
            StepId::Images => "images",
            StepId::Composition => "composition",
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepId::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| format!("Unknown step: {}", s))
    }
}

/// Pipeline type - selects the registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    /// Theme, soundtrack, scene images and the final render
    #[default]
    MusicVideo,
    /// Theme and soundtrack only
    Soundtrack,
    /// Theme, scene images and the final render, no soundtrack
    Slideshow,
}

const MUSIC_VIDEO_STEPS: &[StepId] = &[
    StepId::Theme,
    StepId::Music,
    StepId::Visuals,
    StepId::Images,
    StepId::Composition,
];

const SOUNDTRACK_STEPS: &[StepId] = &[StepId::Theme, StepId::Music];

const SLIDESHOW_STEPS: &[StepId] = &[
    StepId::Theme,
    StepId::Visuals,
    StepId::Images,
    StepId::Composition,
];

impl PipelineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::MusicVideo => "music_video",
            PipelineType::Soundtrack => "soundtrack",
            PipelineType::Slideshow => "slideshow",
        }
    }

    /// Ordered steps for this pipeline type
    pub fn steps(&self) -> &'static [StepId] {
        match self {
            PipelineType::MusicVideo => MUSIC_VIDEO_STEPS,
            PipelineType::Soundtrack => SOUNDTRACK_STEPS,
            PipelineType::Slideshow => SLIDESHOW_STEPS,
        }
    }

    pub fn first_step(&self) -> StepId {
        self.steps()[0]
    }

    /// Step that follows `step`, or None when `step` is the last one
    pub fn next_step(&self, step: StepId) -> Option<StepId> {
        let steps = self.steps();
        steps
            .iter()
            .position(|s| *s == step)
            .and_then(|i| steps.get(i + 1))
            .copied()
    }

    pub fn contains(&self, step: StepId) -> bool {
        self.steps().contains(&step)
    }
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "music_video" => Ok(PipelineType::MusicVideo),
            "soundtrack" => Ok(PipelineType::Soundtrack),
            "slideshow" => Ok(PipelineType::Slideshow),
            other => Err(format!("Unknown pipeline type: {}", other)),
        }
    }
}
