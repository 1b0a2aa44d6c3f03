/// Dimensions attached to delivery and OAuth counters.
#[derive(Debug, Clone, Default)]
pub struct TelemetryLabels {
    pub service: Option<String>,
    pub scope: Option<String>,
    pub outcome: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn service(service: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(3 + self.extra.len());
        if let Some(service) = &self.service {
            tags.push(("service".into(), service.clone()));
        }
        if let Some(scope) = &self.scope {
            tags.push(("scope".into(), scope.clone()));
        }
        if let Some(outcome) = &self.outcome {
            tags.push(("outcome".into(), outcome.clone()));
        }
        tags.extend(self.extra.iter().cloned());
        tags
    }
}
