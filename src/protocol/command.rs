use std::fmt;

/// Client-to-server commands this crate emits.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RequestCommand {
    SubmitJob,
    SubmitJobBg,
    SubmitJobHigh,
    SubmitJobHighBg,
    SubmitJobLow,
    SubmitJobLowBg,
}

impl RequestCommand {
    pub fn code(self) -> u32 {
        match self {
            Self::SubmitJob => 7,
            Self::SubmitJobBg => 18,
            Self::SubmitJobHigh => 21,
            Self::SubmitJobHighBg => 32,
            Self::SubmitJobLow => 33,
            Self::SubmitJobLowBg => 34,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubmitJob => "submit_job",
            Self::SubmitJobBg => "submit_job_bg",
            Self::SubmitJobHigh => "submit_job_high",
            Self::SubmitJobHighBg => "submit_job_high_bg",
            Self::SubmitJobLow => "submit_job_low",
            Self::SubmitJobLowBg => "submit_job_low_bg",
        }
    }
}

impl fmt::Display for RequestCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-to-client commands the engine knows how to handle. Any other code
/// arriving on the stream is a protocol violation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResponseCommand {
    JobCreated,
    WorkStatus,
    WorkComplete,
    WorkFail,
    WorkException,
    WorkData,
    WorkWarning,
}

impl ResponseCommand {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            8 => Some(Self::JobCreated),
            12 => Some(Self::WorkStatus),
            13 => Some(Self::WorkComplete),
            14 => Some(Self::WorkFail),
            25 => Some(Self::WorkException),
            28 => Some(Self::WorkData),
            29 => Some(Self::WorkWarning),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::JobCreated => 8,
            Self::WorkStatus => 12,
            Self::WorkComplete => 13,
            Self::WorkFail => 14,
            Self::WorkException => 25,
            Self::WorkData => 28,
            Self::WorkWarning => 29,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobCreated => "job_created",
            Self::WorkStatus => "work_status",
            Self::WorkComplete => "work_complete",
            Self::WorkFail => "work_fail",
            Self::WorkException => "work_exception",
            Self::WorkData => "work_data",
            Self::WorkWarning => "work_warning",
        }
    }

    /// Terminal events resolve the job, so the registry entry is consumed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::WorkComplete | Self::WorkFail)
    }
}

impl fmt::Display for ResponseCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
