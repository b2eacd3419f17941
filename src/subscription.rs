//! 订阅表
//!
//! 本实例内「连接 → 频道集合」与「频道 → 本地连接集合」双向索引。
//! 单个连接的变更由其专属任务串行发起，跨连接并发访问交给 DashMap 分片锁。
//!
//! 订阅语义：非法/无权频道逐个失败（部分成功，确认集可为请求子集）；
//! 超出单连接频道上限则整个请求原子拒绝，不产生任何部分变更。

use std::collections::HashSet;

use dashmap::DashMap;

use crate::error::{ErrorCode, GatewayError, Result};

/// 频道名约束：1..=64 字符，小写字母/数字/`_`/`-`/`.`，首字符为字母或数字
pub fn is_valid_channel_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'))
}

/// 订阅结果
#[derive(Debug, Default)]
pub struct SubscribeOutcome {
    /// 确认订阅的频道（含此前已订阅的重复请求）
    pub confirmed: Vec<String>,
    /// 逐个被拒绝的频道及原因
    pub rejected: Vec<(String, ErrorCode)>,
    /// 本实例首个订阅者出现的频道（路由器需向代理订阅）
    pub newly_active: Vec<String>,
}

/// 退订结果
#[derive(Debug, Default)]
pub struct UnsubscribeOutcome {
    /// 本实例最后一个订阅者离开的频道（路由器需向代理退订）
    pub deactivated: Vec<String>,
}

/// 订阅表
pub struct SubscriptionTable {
    by_connection: DashMap<String, HashSet<String>>,
    by_channel: DashMap<String, HashSet<String>>,
    max_channels: usize,
}

impl SubscriptionTable {
    pub fn new(max_channels: usize) -> Self {
        Self {
            by_connection: DashMap::new(),
            by_channel: DashMap::new(),
            max_channels,
        }
    }

    /// 订阅频道集合
    ///
    /// `permitted` 为连接认证结果给出的频道白名单
    pub fn subscribe(
        &self,
        connection_id: &str,
        channels: &[String],
        permitted: &[String],
    ) -> Result<SubscribeOutcome> {
        let mut outcome = SubscribeOutcome::default();
        let mut accepted: Vec<String> = Vec::new();

        for channel in channels {
            if accepted.contains(channel) || outcome.confirmed.contains(channel) {
                continue;
            }
            if !is_valid_channel_name(channel) {
                outcome
                    .rejected
                    .push((channel.clone(), ErrorCode::InvalidChannel));
                continue;
            }
            if !permitted.iter().any(|c| c == channel) {
                outcome.rejected.push((channel.clone(), ErrorCode::Forbidden));
                continue;
            }

            let already = self
                .by_connection
                .get(connection_id)
                .map(|set| set.contains(channel))
                .unwrap_or(false);
            if already {
                outcome.confirmed.push(channel.clone());
            } else {
                accepted.push(channel.clone());
            }
        }

        // 上限校验在任何变更之前做，保证整个请求原子拒绝
        let current = self
            .by_connection
            .get(connection_id)
            .map(|set| set.len())
            .unwrap_or(0);
        if current + accepted.len() > self.max_channels {
            return Err(GatewayError::TooManyChannels {
                max: self.max_channels,
            });
        }

        for channel in accepted {
            self.by_connection
                .entry(connection_id.to_string())
                .or_default()
                .insert(channel.clone());
            let mut subscribers = self.by_channel.entry(channel.clone()).or_default();
            let was_empty = subscribers.is_empty();
            subscribers.insert(connection_id.to_string());
            if was_empty {
                outcome.newly_active.push(channel.clone());
            }
            outcome.confirmed.push(channel);
        }

        Ok(outcome)
    }

    /// 退订频道集合，未订阅的频道视为幂等成功
    pub fn unsubscribe(&self, connection_id: &str, channels: &[String]) -> UnsubscribeOutcome {
        let mut outcome = UnsubscribeOutcome::default();
        for channel in channels {
            let removed = self
                .by_connection
                .get_mut(connection_id)
                .map(|mut set| set.remove(channel))
                .unwrap_or(false);
            if removed && self.detach_subscriber(channel, connection_id) {
                outcome.deactivated.push(channel.clone());
            }
        }
        outcome
    }

    /// 连接关闭时释放其全部订阅
    pub fn remove_connection(&self, connection_id: &str) -> UnsubscribeOutcome {
        let mut outcome = UnsubscribeOutcome::default();
        if let Some((_, channels)) = self.by_connection.remove(connection_id) {
            for channel in channels {
                if self.detach_subscriber(&channel, connection_id) {
                    outcome.deactivated.push(channel);
                }
            }
        }
        outcome
    }

    /// 订阅某频道的本地连接
    pub fn connections_for(&self, channel: &str) -> Vec<String> {
        self.by_channel
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 连接当前订阅的频道
    pub fn channels_of(&self, connection_id: &str) -> Vec<String> {
        self.by_connection
            .get(connection_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.by_connection.iter().map(|e| e.value().len()).sum()
    }

    /// 从频道索引中摘除连接，返回频道是否因此失去最后一个订阅者
    fn detach_subscriber(&self, channel: &str, connection_id: &str) -> bool {
        if let Some(mut subscribers) = self.by_channel.get_mut(channel) {
            subscribers.remove(connection_id);
            if subscribers.is_empty() {
                drop(subscribers);
                self.by_channel
                    .remove_if(channel, |_, set| set.is_empty());
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permitted() -> Vec<String> {
        vec!["error_docs".into(), "alerts".into(), "billing".into()]
    }

    #[test]
    fn test_partial_success() {
        let table = SubscriptionTable::new(10);
        let outcome = table
            .subscribe(
                "c1",
                &["error_docs".into(), "UPPER".into(), "secret".into()],
                &permitted(),
            )
            .unwrap();
        assert_eq!(outcome.confirmed, vec!["error_docs".to_string()]);
        assert_eq!(outcome.rejected.len(), 2);
        assert!(outcome
            .rejected
            .contains(&("UPPER".into(), ErrorCode::InvalidChannel)));
        assert!(outcome
            .rejected
            .contains(&("secret".into(), ErrorCode::Forbidden)));
        assert_eq!(outcome.newly_active, vec!["error_docs".to_string()]);
    }

    #[test]
    fn test_too_many_channels_is_atomic() {
        let table = SubscriptionTable::new(2);
        table
            .subscribe("c1", &["error_docs".into()], &permitted())
            .unwrap();

        let err = table
            .subscribe("c1", &["alerts".into(), "billing".into()], &permitted())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TooManyChannels);
        // 整个请求被拒绝，表中无任何部分变更
        assert_eq!(table.channels_of("c1"), vec!["error_docs".to_string()]);
        assert!(table.connections_for("alerts").is_empty());
    }

    #[test]
    fn test_resubscribe_is_confirmed_without_duplication() {
        let table = SubscriptionTable::new(10);
        table
            .subscribe("c1", &["error_docs".into()], &permitted())
            .unwrap();
        let outcome = table
            .subscribe("c1", &["error_docs".into()], &permitted())
            .unwrap();
        assert_eq!(outcome.confirmed, vec!["error_docs".to_string()]);
        assert!(outcome.newly_active.is_empty());
        assert_eq!(table.subscription_count(), 1);
    }

    #[test]
    fn test_unsubscribe_idempotent() {
        let table = SubscriptionTable::new(10);
        table
            .subscribe("c1", &["error_docs".into()], &permitted())
            .unwrap();

        let outcome = table.unsubscribe("c1", &["error_docs".into()]);
        assert_eq!(outcome.deactivated, vec!["error_docs".to_string()]);

        // 重复退订是无操作
        let outcome = table.unsubscribe("c1", &["error_docs".into(), "alerts".into()]);
        assert!(outcome.deactivated.is_empty());
    }

    #[test]
    fn test_channel_stays_active_while_other_subscriber_remains() {
        let table = SubscriptionTable::new(10);
        table
            .subscribe("c1", &["error_docs".into()], &permitted())
            .unwrap();
        let outcome = table
            .subscribe("c2", &["error_docs".into()], &permitted())
            .unwrap();
        assert!(outcome.newly_active.is_empty());

        let outcome = table.remove_connection("c1");
        assert!(outcome.deactivated.is_empty());

        let outcome = table.remove_connection("c2");
        assert_eq!(outcome.deactivated, vec!["error_docs".to_string()]);
        assert!(table.connections_for("error_docs").is_empty());
    }
}
