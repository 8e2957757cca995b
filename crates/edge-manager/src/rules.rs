//! Alert rule conditions.
//!
//! A condition is a list of comparisons `<metric> <op> <number>` joined with
//! `&&` and `||`, where `&&` binds tighter:
//!
//! ```text
//! cpu_usage > 80 && memory_usage >= 70 || error_rate > 5
//! ```
//!
//! Metric names are fields of [`SystemMetrics`], see [`Metric`].

use crate::types::SystemMetrics;
use common::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Snapshot field a comparison reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    CpuUsage,
    MemoryUsage,
    DiskUsage,
    TaskCount,
    ActiveTasks,
    CompletedTasks,
    FailedTasks,
    QueueSize,
    ErrorRate,
    ResponseTime,
    DbConnections,
    DbInUse,
    CacheKeys,
    CacheHitRate,
    ActiveModels,
}

impl Metric {
    pub const ALL: [Metric; 15] = [
        Metric::CpuUsage,
        Metric::MemoryUsage,
        Metric::DiskUsage,
        Metric::TaskCount,
        Metric::ActiveTasks,
        Metric::CompletedTasks,
        Metric::FailedTasks,
        Metric::QueueSize,
        Metric::ErrorRate,
        Metric::ResponseTime,
        Metric::DbConnections,
        Metric::DbInUse,
        Metric::CacheKeys,
        Metric::CacheHitRate,
        Metric::ActiveModels,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::CpuUsage => "cpu_usage",
            Metric::MemoryUsage => "memory_usage",
            Metric::DiskUsage => "disk_usage",
            Metric::TaskCount => "task_count",
            Metric::ActiveTasks => "active_tasks",
            Metric::CompletedTasks => "completed_tasks",
            Metric::FailedTasks => "failed_tasks",
            Metric::QueueSize => "queue_size",
            Metric::ErrorRate => "error_rate",
            Metric::ResponseTime => "response_time",
            Metric::DbConnections => "db_connections",
            Metric::DbInUse => "db_in_use",
            Metric::CacheKeys => "cache_keys",
            Metric::CacheHitRate => "cache_hit_rate",
            Metric::ActiveModels => "active_models",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }

    /// Read this metric from a snapshot.
    pub fn read(self, m: &SystemMetrics) -> f64 {
        match self {
            Metric::CpuUsage => m.resource.cpu_usage,
            Metric::MemoryUsage => m.resource.memory_usage,
            Metric::DiskUsage => m.resource.disk_usage,
            Metric::TaskCount => m.resource.task_count as f64,
            Metric::ActiveTasks => m.application.active_tasks as f64,
            Metric::CompletedTasks => m.application.completed_tasks as f64,
            Metric::FailedTasks => m.application.failed_tasks as f64,
            Metric::QueueSize => m.application.queue_size as f64,
            Metric::ErrorRate => m.application.error_rate,
            Metric::ResponseTime => m.application.response_time,
            Metric::DbConnections => m.store.connections as f64,
            Metric::DbInUse => m.store.in_use as f64,
            Metric::CacheKeys => m.cache.key_count as f64,
            Metric::CacheHitRate => m.cache.hit_rate,
            Metric::ActiveModels => m.models.active_models as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }

    fn apply(self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Eq => (left - right).abs() < f64::EPSILON,
            CompareOp::Ne => (left - right).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Comparison {
    pub metric: Metric,
    pub op: CompareOp,
    pub value: f64,
}

impl Comparison {
    pub fn holds(&self, snapshot: &SystemMetrics) -> bool {
        self.op.apply(self.metric.read(snapshot), self.value)
    }
}

/// Parsed condition in disjunctive normal form: any group whose comparisons
/// all hold makes the condition true.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    groups: Vec<Vec<Comparison>>,
}

impl Condition {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(Error::invalid_rule("empty condition"));
        }

        let mut groups = vec![Vec::new()];
        let mut iter = tokens.into_iter().peekable();
        loop {
            let metric = match iter.next() {
                Some(Token::Ident(name)) => Metric::from_name(&name)
                    .ok_or_else(|| Error::invalid_rule(format!("unknown metric '{}'", name)))?,
                other => return Err(unexpected(other, "metric name")),
            };
            let op = match iter.next() {
                Some(Token::Op(op)) => op,
                other => return Err(unexpected(other, "comparison operator")),
            };
            let value = match iter.next() {
                Some(Token::Number(value)) => value,
                other => return Err(unexpected(other, "number")),
            };

            if let Some(group) = groups.last_mut() {
                group.push(Comparison { metric, op, value });
            }

            match iter.next() {
                None => break,
                Some(Token::And) => {}
                Some(Token::Or) => groups.push(Vec::new()),
                other => return Err(unexpected(other, "'&&', '||' or end of condition")),
            }
            if iter.peek().is_none() {
                return Err(Error::invalid_rule("condition ends with a dangling operator"));
            }
        }

        Ok(Self { groups })
    }

    pub fn evaluate(&self, snapshot: &SystemMetrics) -> bool {
        self.groups
            .iter()
            .any(|group| group.iter().all(|c| c.holds(snapshot)))
    }

    /// Every metric this condition reads.
    pub fn metrics(&self) -> impl Iterator<Item = Metric> + '_ {
        self.groups.iter().flatten().map(|c| c.metric)
    }
}

impl FromStr for Condition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (g, group) in self.groups.iter().enumerate() {
            if g > 0 {
                f.write_str(" || ")?;
            }
            for (i, c) in group.iter().enumerate() {
                if i > 0 {
                    f.write_str(" && ")?;
                }
                write!(f, "{} {} {}", c.metric.name(), c.op.symbol(), c.value)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Op(CompareOp),
    And,
    Or,
}

fn unexpected(token: Option<Token>, expected: &str) -> Error {
    match token {
        Some(t) => Error::invalid_rule(format!("expected {}, found {:?}", expected, t)),
        None => Error::invalid_rule(format!("expected {}, found end of condition", expected)),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit()
            || c == '.'
            || (c == '-' && next.is_some_and(|n| n.is_ascii_digit() || n == '.'))
        {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal
                .parse::<f64>()
                .map_err(|_| Error::invalid_rule(format!("invalid number '{}'", literal)))?;
            tokens.push(Token::Number(value));
        } else {
            let (token, width) = match (c, next) {
                ('>', Some('=')) => (Token::Op(CompareOp::Ge), 2),
                ('<', Some('=')) => (Token::Op(CompareOp::Le), 2),
                ('=', Some('=')) => (Token::Op(CompareOp::Eq), 2),
                ('!', Some('=')) => (Token::Op(CompareOp::Ne), 2),
                ('&', Some('&')) => (Token::And, 2),
                ('|', Some('|')) => (Token::Or, 2),
                ('>', _) => (Token::Op(CompareOp::Gt), 1),
                ('<', _) => (Token::Op(CompareOp::Lt), 1),
                _ => {
                    return Err(Error::invalid_rule(format!(
                        "unexpected character '{}' at offset {}",
                        c, i
                    )));
                }
            };
            tokens.push(token);
            i += width;
        }
    }

    Ok(tokens)
}
