use serde::{Deserialize, Serialize};

/// One lifecycle stage of a recall. Init stages run once per recall,
/// the others once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StagingStage {
    InitPre,
    InitInter,
    InitPost,
    /// Apply automation lanes to ports before computation.
    Automate,
    RunPre,
    RunInter,
    RunPost,
}

impl StagingStage {
    pub fn name(self) -> &'static str {
        match self {
            StagingStage::InitPre => "init-pre",
            StagingStage::InitInter => "init-inter",
            StagingStage::InitPost => "init-post",
            StagingStage::Automate => "automate",
            StagingStage::RunPre => "run-pre",
            StagingStage::RunInter => "run-inter",
            StagingStage::RunPost => "run-post",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "init-pre" | "init_pre" => Some(StagingStage::InitPre),
            "init-inter" | "init_inter" => Some(StagingStage::InitInter),
            "init-post" | "init_post" => Some(StagingStage::InitPost),
            "automate" => Some(StagingStage::Automate),
            "run-pre" | "run_pre" => Some(StagingStage::RunPre),
            "run-inter" | "run_inter" => Some(StagingStage::RunInter),
            "run-post" | "run_post" => Some(StagingStage::RunPost),
            _ => None,
        }
    }

    pub fn is_init(self) -> bool {
        matches!(
            self,
            StagingStage::InitPre | StagingStage::InitInter | StagingStage::InitPost
        )
    }
}

/// Ordered list of stages executed against the recall tree each tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingProgram {
    stages: Vec<StagingStage>,
}

impl Default for StagingProgram {
    fn default() -> Self {
        Self {
            stages: vec![
                StagingStage::InitPre,
                StagingStage::InitInter,
                StagingStage::InitPost,
                StagingStage::Automate,
                StagingStage::RunPre,
                StagingStage::RunInter,
                StagingStage::RunPost,
            ],
        }
    }
}

impl StagingProgram {
    pub fn new(stages: Vec<StagingStage>) -> Self {
        Self { stages }
    }

    /// Build a program from stage names. Unknown names are returned as the error.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let mut stages = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            match StagingStage::from_name(name) {
                Some(stage) => stages.push(stage),
                None => return Err(format!("unknown staging stage '{}'", name)),
            }
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StagingStage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
