/// Cpu and memory in canonical units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceQuantity {
    pub cpu_millicores: i64,
    pub memory_bytes: i64,
}

impl ResourceQuantity {
    pub fn new(cpu_millicores: i64, memory_bytes: i64) -> Self {
        Self {
            cpu_millicores,
            memory_bytes,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.cpu_millicores == 0 && self.memory_bytes == 0
    }

    /// Integer division of both components (truncating).
    pub fn per(&self, count: i64) -> ResourceQuantity {
        ResourceQuantity {
            cpu_millicores: self.cpu_millicores / count,
            memory_bytes: self.memory_bytes / count,
        }
    }

    pub fn times(&self, factor: i64) -> ResourceQuantity {
        ResourceQuantity {
            cpu_millicores: self.cpu_millicores * factor,
            memory_bytes: self.memory_bytes * factor,
        }
    }
}

impl std::ops::Add for ResourceQuantity {
    type Output = ResourceQuantity;
    fn add(self, other: Self) -> ResourceQuantity {
        ResourceQuantity {
            cpu_millicores: self.cpu_millicores + other.cpu_millicores,
            memory_bytes: self.memory_bytes + other.memory_bytes,
        }
    }
}

impl std::ops::AddAssign for ResourceQuantity {
    fn add_assign(&mut self, other: Self) {
        self.cpu_millicores += other.cpu_millicores;
        self.memory_bytes += other.memory_bytes;
    }
}

impl std::iter::Sum for ResourceQuantity {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(ResourceQuantity::default(), |acc, v| acc + v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    /// long-running, replica count driven (and maybe autoscaled)
    Deployment,
    /// runs to completion, sized by completions / parallelism
    CronJob,
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deployment => "Deployment",
            Self::CronJob => "CronJob",
        };
        f.write_str(s)
    }
}

/// One row of the report, whatever the source it was collected from.
///
/// `location` is the namespace for workloads read from the cluster, and the
/// resolved deployment target for services read from Porter.
///
/// `max_requests` is only meaningful when `max_replicas > desired_replicas`;
/// see [`crate::rollup::select`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRecord {
    pub name: String,
    pub location: String,
    pub kind: WorkloadKind,
    pub current_replicas: i32,
    pub desired_replicas: i32,
    pub max_replicas: i32,
    pub usage: ResourceQuantity,
    pub requests: ResourceQuantity,
    pub max_requests: ResourceQuantity,
}

impl MetricRecord {
    pub fn new(name: impl Into<String>, location: impl Into<String>, kind: WorkloadKind) -> Self {
        MetricRecord {
            name: name.into(),
            location: location.into(),
            kind,
            current_replicas: 0,
            desired_replicas: 0,
            max_replicas: 0,
            usage: ResourceQuantity::default(),
            requests: ResourceQuantity::default(),
            max_requests: ResourceQuantity::default(),
        }
    }

    /// `true` when an autoscaler allows more replicas than currently desired.
    pub fn has_scaling_headroom(&self) -> bool {
        self.max_replicas > self.desired_replicas
    }
}
