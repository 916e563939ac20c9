//! kovi-plugin-invite-guard
//!
//! 群邀请守卫插件
//!
//! 入群邀请: 群在黑名单 → 拒绝 | 邀请者在黑名单 → 拒绝 | 其余 → 自动同意
//! 群消息: 群在黑名单 → 通知后退群 | 发送者在黑名单 → @警告
//! 私聊: 发送者在黑名单 → 静默丢弃
//!
//! 管理指令: blacklist add|remove|list user|group [号码]
//! 中文别名: 添加黑名单群 | 移除黑名单群 | 添加黑名单用户 | 移除黑名单用户 | 黑名单列表 群/用户

// --- 类型定义 ---
mod types {
    use super::error::GuardError;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeSet;
    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum ListKind {
        User,
        Group,
    }

    impl fmt::Display for ListKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                ListKind::User => f.write_str("用户"),
                ListKind::Group => f.write_str("群"),
            }
        }
    }

    /// 黑名单，落盘格式为 `{"users": [...], "groups": [...]}`
    ///
    /// 号码一律按字符串比较，不做数值化处理（前导零有意义）。
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Blacklist {
        #[serde(default)]
        pub users: BTreeSet<String>,
        #[serde(default)]
        pub groups: BTreeSet<String>,
    }

    impl Blacklist {
        pub fn set(&self, kind: ListKind) -> &BTreeSet<String> {
            match kind {
                ListKind::User => &self.users,
                ListKind::Group => &self.groups,
            }
        }

        pub fn set_mut(&mut self, kind: ListKind) -> &mut BTreeSet<String> {
            match kind {
                ListKind::User => &mut self.users,
                ListKind::Group => &mut self.groups,
            }
        }

        pub fn contains(&self, kind: ListKind, id: &str) -> bool {
            self.set(kind).contains(id)
        }

        pub fn contains_user(&self, id: &str) -> bool {
            self.users.contains(id)
        }

        pub fn contains_group(&self, id: &str) -> bool {
            self.groups.contains(id)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Invite {
        pub group_id: String,
        pub inviter_id: String,
        /// 平台下发的请求标识 (flag)，同意/拒绝都需要它
        pub token: Option<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum InboundEvent {
        GroupInvite(Invite),
        GroupMessage { sender_id: String, group_id: String },
        PrivateMessage { sender_id: String },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RejectReason {
        BlacklistedGroup,
        BlacklistedInviter,
    }

    impl fmt::Display for RejectReason {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                RejectReason::BlacklistedGroup => f.write_str("群在黑名单中"),
                RejectReason::BlacklistedInviter => f.write_str("邀请者在黑名单中"),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Decision {
        Accept(Invite),
        Reject(Invite, RejectReason),
        Warn { group_id: String, sender_id: String },
        Suppress,
        Leave(String),
        Allow,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Propagation {
        Continue,
        Stop,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Outcome {
        /// 放行，继续后续处理
        Passed,
        Handled,
        Failed(GuardError),
    }

    impl Outcome {
        pub fn propagation(&self) -> Propagation {
            match self {
                Outcome::Passed => Propagation::Continue,
                Outcome::Handled | Outcome::Failed(_) => Propagation::Stop,
            }
        }

        pub fn is_failed(&self) -> bool {
            matches!(self, Outcome::Failed(_))
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Mutation {
        Added,
        Removed,
        AlreadyPresent,
        NotFound,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub enum Target {
        Group(String),
        User(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Notice {
        pub mention: Option<String>,
        pub text: String,
    }

    impl Notice {
        pub fn text(text: impl Into<String>) -> Self {
            Self {
                mention: None,
                text: text.into(),
            }
        }

        pub fn mention(id: &str, text: impl Into<String>) -> Self {
            Self {
                mention: Some(id.to_string()),
                text: text.into(),
            }
        }
    }

}

// --- 错误 ---
mod error {
    use super::types::ListKind;
    use thiserror::Error;

    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum GuardError {
        #[error("{kind}黑名单已满（上限 {max}）")]
        CapacityExceeded { kind: ListKind, max: usize },
        #[error("黑名单文件格式错误: {0}")]
        MalformedPersistedState(String),
        #[error("黑名单保存失败: {0}")]
        Persist(String),
        #[error("邀请缺少 flag，无法处理")]
        MissingToken,
        #[error("{action} 调用失败: {reason}")]
        ExternalCallFailed { action: &'static str, reason: String },
        #[error("{action} 调用超时（{ms} 毫秒）")]
        Timeout { action: &'static str, ms: u64 },
    }
}

// --- 配置 ---
mod config {
    use kovi::log::error;
    use kovi::utils::load_json_data;
    use serde::{Deserialize, Serialize};
    use std::path::Path;
    use std::time::Duration;

    pub const FILE_NAME: &str = "config.json";

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Config {
        /// 拒绝邀请时附带的理由
        pub reject_reason: String,
        /// @黑名单用户 之后的警告文本
        pub warn_template: String,
        /// 退群前发到群里的通知，留空则不发
        pub leave_notice: String,
        /// 每个名单的容量上限，null 为不限
        pub max_entries: Option<usize>,
        /// 巡检间隔（秒），0 关闭巡检
        pub sweep_interval_secs: u64,
        pub call_timeout_secs: u64,
        /// 退群通知的等待上限（毫秒），不超过 call_timeout_secs
        pub notice_timeout_ms: u64,
        /// 邀请处理结果私聊通知主管理员
        pub notify_invite_result: bool,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                reject_reason: "该群/邀请者已被Bot管理员列入黑名单".to_string(),
                warn_template: " 你已被列入黑名单，Bot 将不再响应你的消息".to_string(),
                leave_notice: "本群已被列入黑名单，Bot 即将退群".to_string(),
                max_entries: None,
                sweep_interval_secs: 300,
                call_timeout_secs: 10,
                notice_timeout_ms: 2000,
                notify_invite_result: true,
            }
        }
    }

    impl Config {
        pub fn load(dir: &Path) -> Self {
            let path = dir.join(FILE_NAME);
            let default = Config::default();
            match load_json_data(default.clone(), path.clone()) {
                Ok(c) => c,
                Err(e) => {
                    error!("配置文件 {} 解析失败，使用默认配置: {}", path.display(), e);
                    default
                }
            }
        }

        pub fn call_timeout(&self) -> Duration {
            Duration::from_secs(self.call_timeout_secs.max(1))
        }

        pub fn notice_timeout(&self) -> Duration {
            Duration::from_millis(self.notice_timeout_ms).min(self.call_timeout())
        }

        pub fn sweep_interval(&self) -> Option<Duration> {
            (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn partial_file_keeps_defaults() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(
                dir.path().join(FILE_NAME),
                r#"{"sweep_interval_secs": 0, "max_entries": 50}"#,
            )
            .unwrap();

            let c = Config::load(dir.path());
            assert_eq!(c.sweep_interval(), None);
            assert_eq!(c.max_entries, Some(50));
            assert_eq!(c.reject_reason, Config::default().reject_reason);
            assert_eq!(c.call_timeout(), Duration::from_secs(10));
        }

        #[test]
        fn malformed_file_falls_back_to_defaults() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join(FILE_NAME), "{ not json").unwrap();

            let c = Config::load(dir.path());
            assert_eq!(c.sweep_interval(), Some(Duration::from_secs(300)));
            assert!(c.notify_invite_result);
        }

        #[test]
        fn zero_timeout_is_clamped() {
            let c = Config {
                call_timeout_secs: 0,
                ..Config::default()
            };
            assert_eq!(c.call_timeout(), Duration::from_secs(1));
        }

        #[test]
        fn notice_timeout_never_exceeds_call_timeout() {
            assert_eq!(Config::default().notice_timeout(), Duration::from_secs(2));

            let c = Config {
                call_timeout_secs: 1,
                notice_timeout_ms: 5000,
                ..Config::default()
            };
            assert_eq!(c.notice_timeout(), Duration::from_secs(1));
        }
    }
}

// --- 黑名单存储 ---
mod store {
    use super::error::GuardError;
    use super::types::{Blacklist, ListKind, Mutation};
    use kovi::log::{error, info, warn};
    use kovi::tokio::sync::{RwLock, RwLockReadGuard};
    use kovi::utils::{load_json_data, save_json_data};
    use std::path::{Path, PathBuf};

    pub const FILE_NAME: &str = "blacklist.json";

    pub struct Store {
        list: RwLock<Blacklist>,
        path: PathBuf,
        max_entries: Option<usize>,
    }

    impl Store {
        /// 从数据目录加载。文件不存在视为空名单；格式错误时备份原文件并以空名单启动。
        pub fn load(dir: &Path, max_entries: Option<usize>) -> Self {
            let path = dir.join(FILE_NAME);
            let list = match read_document(&path) {
                Ok(list) => {
                    info!(
                        "黑名单已加载: {} 个用户, {} 个群",
                        list.users.len(),
                        list.groups.len()
                    );
                    list
                }
                Err(e) => {
                    error!("{}，以空黑名单启动", e);
                    let backup = path.with_extension("json.broken");
                    if let Err(e) = std::fs::rename(&path, &backup) {
                        warn!("备份损坏的黑名单文件失败: {}", e);
                    }
                    Blacklist::default()
                }
            };
            Self {
                list: RwLock::new(list),
                path,
                max_entries,
            }
        }

        pub async fn read(&self) -> RwLockReadGuard<'_, Blacklist> {
            self.list.read().await
        }

        pub async fn contains(&self, kind: ListKind, id: &str) -> bool {
            self.list.read().await.contains(kind, id)
        }

        pub async fn contains_user(&self, id: &str) -> bool {
            self.contains(ListKind::User, id).await
        }

        pub async fn contains_group(&self, id: &str) -> bool {
            self.contains(ListKind::Group, id).await
        }

        /// 加入名单并立即落盘；落盘失败时撤销内存中的修改
        pub async fn add(&self, kind: ListKind, id: &str) -> Result<Mutation, GuardError> {
            let mut list = self.list.write().await;
            if list.contains(kind, id) {
                return Ok(Mutation::AlreadyPresent);
            }
            if let Some(max) = self.max_entries
                && list.set(kind).len() >= max
            {
                return Err(GuardError::CapacityExceeded { kind, max });
            }

            list.set_mut(kind).insert(id.to_string());
            if let Err(e) = self.flush(&list) {
                list.set_mut(kind).remove(id);
                return Err(e);
            }
            Ok(Mutation::Added)
        }

        pub async fn remove(&self, kind: ListKind, id: &str) -> Result<Mutation, GuardError> {
            let mut list = self.list.write().await;
            if !list.set_mut(kind).remove(id) {
                return Ok(Mutation::NotFound);
            }
            if let Err(e) = self.flush(&list) {
                list.set_mut(kind).insert(id.to_string());
                return Err(e);
            }
            Ok(Mutation::Removed)
        }

        pub async fn add_user(&self, id: &str) -> Result<Mutation, GuardError> {
            self.add(ListKind::User, id).await
        }

        pub async fn add_group(&self, id: &str) -> Result<Mutation, GuardError> {
            self.add(ListKind::Group, id).await
        }

        pub async fn remove_user(&self, id: &str) -> Result<Mutation, GuardError> {
            self.remove(ListKind::User, id).await
        }

        pub async fn remove_group(&self, id: &str) -> Result<Mutation, GuardError> {
            self.remove(ListKind::Group, id).await
        }

        /// 按字典序返回当前名单
        pub async fn list(&self, kind: ListKind) -> Vec<String> {
            self.list.read().await.set(kind).iter().cloned().collect()
        }

        pub async fn list_users(&self) -> Vec<String> {
            self.list(ListKind::User).await
        }

        pub async fn list_groups(&self) -> Vec<String> {
            self.list(ListKind::Group).await
        }

        pub async fn save(&self) -> Result<(), GuardError> {
            // 写锁：与 add/remove 的落盘互斥，避免并发写同一个临时文件
            let list = self.list.write().await;
            self.flush(&list)
        }

        fn flush(&self, list: &Blacklist) -> Result<(), GuardError> {
            let tmp = self.path.with_extension("json.tmp");
            save_json_data(list, &tmp).map_err(|e| GuardError::Persist(e.to_string()))?;
            std::fs::rename(&tmp, &self.path).map_err(|e| GuardError::Persist(e.to_string()))
        }
    }

    pub fn read_document(path: &Path) -> Result<Blacklist, GuardError> {
        if !path.exists() {
            return Ok(Blacklist::default());
        }
        load_json_data(Blacklist::default(), path).map_err(|e| {
            GuardError::MalformedPersistedState(format!("{}: {}", path.display(), e))
        })
    }

}

// --- 决策 ---
mod filter {
    use super::types::{Blacklist, Decision, InboundEvent, RejectReason};

    /// 按黑名单为事件选出唯一决策，先匹配者优先
    pub fn classify(event: &InboundEvent, list: &Blacklist) -> Decision {
        match event {
            InboundEvent::GroupInvite(invite) => {
                // 群优先于邀请者
                if list.contains_group(&invite.group_id) {
                    Decision::Reject(invite.clone(), RejectReason::BlacklistedGroup)
                } else if list.contains_user(&invite.inviter_id) {
                    Decision::Reject(invite.clone(), RejectReason::BlacklistedInviter)
                } else {
                    Decision::Accept(invite.clone())
                }
            }
            InboundEvent::GroupMessage {
                sender_id,
                group_id,
            } => {
                if list.contains_group(group_id) {
                    Decision::Leave(group_id.clone())
                } else if list.contains_user(sender_id) {
                    Decision::Warn {
                        group_id: group_id.clone(),
                        sender_id: sender_id.clone(),
                    }
                } else {
                    Decision::Allow
                }
            }
            InboundEvent::PrivateMessage { sender_id } => {
                if list.contains_user(sender_id) {
                    Decision::Suppress
                } else {
                    Decision::Allow
                }
            }
        }
    }

}

// --- 平台能力 ---
mod platform {
    use super::types::{Notice, Target};
    use std::future::Future;

    /// 插件依赖的平台能力，由适配层实现
    pub trait Platform: Send + Sync {
        /// 处理入群邀请，`reason` 只在拒绝时携带
        fn answer_invite(
            &self,
            token: &str,
            approve: bool,
            reason: Option<&str>,
        ) -> impl Future<Output = anyhow::Result<()>> + Send;

        fn leave_group(&self, group_id: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

        fn send_message(
            &self,
            target: &Target,
            notice: &Notice,
        ) -> impl Future<Output = anyhow::Result<()>> + Send;

        fn list_joined_groups(&self) -> impl Future<Output = anyhow::Result<Vec<String>>> + Send;

        /// 是否支持获取群列表；巡检启动时检查一次
        fn supports_group_list(&self) -> bool {
            true
        }
    }
}

// --- 执行 ---
mod dispatch {
    use super::config::Config;
    use super::error::GuardError;
    use super::platform::Platform;
    use super::types::{Decision, Invite, Notice, Outcome, RejectReason, Target};
    use kovi::log::{error, info, warn};
    use kovi::tokio::sync::Mutex;
    use kovi::tokio::time::timeout;
    use std::collections::HashSet;
    use std::future::Future;
    use std::time::Duration;

    pub struct Dispatcher<P> {
        platform: P,
        config: Config,
        /// 已发过退群通知、但还没退成功的群
        noticed: Mutex<HashSet<String>>,
    }

    impl<P: Platform> Dispatcher<P> {
        pub fn new(platform: P, config: Config) -> Self {
            Self {
                platform,
                config,
                noticed: Mutex::new(HashSet::new()),
            }
        }

        pub fn platform(&self) -> &P {
            &self.platform
        }

        pub fn config(&self) -> &Config {
            &self.config
        }

        /// 执行决策。平台调用失败只记日志并转为 `Outcome::Failed`，不自动重试。
        pub async fn dispatch(&self, decision: &Decision) -> Outcome {
            let result = match decision {
                Decision::Allow => return Outcome::Passed,
                Decision::Suppress => return Outcome::Handled,
                Decision::Accept(invite) => self.answer(invite, None).await,
                Decision::Reject(invite, reason) => self.answer(invite, Some(*reason)).await,
                Decision::Leave(group_id) => self.leave(group_id).await,
                Decision::Warn {
                    group_id,
                    sender_id,
                } => {
                    let notice = Notice::mention(sender_id, self.config.warn_template.as_str());
                    let result = self.notify(&Target::Group(group_id.clone()), &notice).await;
                    if result.is_ok() {
                        info!("已在群 {} 警告黑名单用户 {}", group_id, sender_id);
                    }
                    result
                }
            };

            match result {
                Ok(()) => Outcome::Handled,
                Err(e) => {
                    error!("执行 {:?} 失败: {}", decision, e);
                    Outcome::Failed(e)
                }
            }
        }

        async fn answer(
            &self,
            invite: &Invite,
            reject: Option<RejectReason>,
        ) -> Result<(), GuardError> {
            let token = invite.token.as_deref().ok_or(GuardError::MissingToken)?;
            let approve = reject.is_none();
            let reason = reject.map(|_| self.config.reject_reason.as_str());
            self.call(
                "set_group_add_request",
                self.platform.answer_invite(token, approve, reason),
            )
            .await?;

            match reject {
                None => info!(
                    "已自动同意加入群 {}（邀请者：{}）",
                    invite.group_id, invite.inviter_id
                ),
                Some(r) => info!(
                    "已拒绝加入群 {}（邀请者：{}）: {}",
                    invite.group_id, invite.inviter_id, r
                ),
            }
            Ok(())
        }

        /// 先尽力发送退群通知，通知失败不影响退群。
        /// 通知只等 `notice_timeout`；退群一直失败时同一个群只通知一次。
        async fn leave(&self, group_id: &str) -> Result<(), GuardError> {
            let first_attempt = self.noticed.lock().await.insert(group_id.to_string());
            if first_attempt && !self.config.leave_notice.is_empty() {
                let target = Target::Group(group_id.to_string());
                let notice = Notice::text(self.config.leave_notice.as_str());
                let sent = self.call_within(
                    "send_msg",
                    self.config.notice_timeout(),
                    self.platform.send_message(&target, &notice),
                );
                if let Err(e) = sent.await {
                    warn!("群 {} 退群通知发送失败: {}", group_id, e);
                }
            }
            self.call("set_group_leave", self.platform.leave_group(group_id))
                .await?;
            self.noticed.lock().await.remove(group_id);
            info!("已退出黑名单群 {}", group_id);
            Ok(())
        }

        pub async fn notify(&self, target: &Target, notice: &Notice) -> Result<(), GuardError> {
            self.call("send_msg", self.platform.send_message(target, notice))
                .await
        }

        pub async fn joined_groups(&self) -> Result<Vec<String>, GuardError> {
            self.call("get_group_list", self.platform.list_joined_groups())
                .await
        }

        async fn call<T>(
            &self,
            action: &'static str,
            fut: impl Future<Output = anyhow::Result<T>>,
        ) -> Result<T, GuardError> {
            self.call_within(action, self.config.call_timeout(), fut)
                .await
        }

        async fn call_within<T>(
            &self,
            action: &'static str,
            limit: Duration,
            fut: impl Future<Output = anyhow::Result<T>>,
        ) -> Result<T, GuardError> {
            match timeout(limit, fut).await {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(GuardError::ExternalCallFailed {
                    action,
                    reason: e.to_string(),
                }),
                Err(_) => Err(GuardError::Timeout {
                    action,
                    ms: limit.as_millis() as u64,
                }),
            }
        }
    }

}

// --- 上下文 ---
mod guard {
    use super::config::Config;
    use super::dispatch::Dispatcher;
    use super::error::GuardError;
    use super::filter::classify;
    use super::platform::Platform;
    use super::store::Store;
    use super::types::{Decision, InboundEvent, Notice, Outcome, RejectReason, Target};
    use kovi::log::{debug, info, warn};

    /// 插件的全部状态，显式传给各个处理函数
    pub struct Guard<P> {
        store: Store,
        dispatcher: Dispatcher<P>,
        /// 接收邀请处理结果的主管理员
        operator: Option<String>,
    }

    impl<P: Platform> Guard<P> {
        pub fn new(store: Store, dispatcher: Dispatcher<P>, operator: Option<String>) -> Self {
            Self {
                store,
                dispatcher,
                operator,
            }
        }

        pub fn store(&self) -> &Store {
            &self.store
        }

        pub fn dispatcher(&self) -> &Dispatcher<P> {
            &self.dispatcher
        }

        pub fn config(&self) -> &Config {
            self.dispatcher.config()
        }

        pub async fn handle(&self, event: &InboundEvent) -> Outcome {
            let decision = {
                let list = self.store.read().await;
                classify(event, &list)
            };
            match &decision {
                Decision::Allow => {}
                Decision::Suppress => info!("已屏蔽黑名单用户的消息: {:?}", event),
                d => debug!("{:?} => {:?}", event, d),
            }

            let outcome = self.dispatcher.dispatch(&decision).await;
            self.report_invite(&decision, &outcome).await;
            outcome
        }

        async fn report_invite(&self, decision: &Decision, outcome: &Outcome) {
            let Some(operator) = self
                .operator
                .as_deref()
                .filter(|_| self.config().notify_invite_result)
            else {
                return;
            };

            let text = match (decision, outcome) {
                (Decision::Accept(i) | Decision::Reject(i, _), Outcome::Failed(e)) => {
                    format!("⚠️ 处理群 {} 的入群邀请失败: {}", i.group_id, e)
                }
                (Decision::Accept(i), _) => format!(
                    "✅ 已自动同意加入群 {}（邀请者：{}）",
                    i.group_id, i.inviter_id
                ),
                (Decision::Reject(i, RejectReason::BlacklistedGroup), _) => format!(
                    "🚫 已拒绝加入黑名单群 {}（邀请者：{}）",
                    i.group_id, i.inviter_id
                ),
                (Decision::Reject(i, RejectReason::BlacklistedInviter), _) => format!(
                    "🚫 已拒绝黑名单用户 {} 的邀请（群 {}）",
                    i.inviter_id, i.group_id
                ),
                _ => return,
            };

            let target = Target::User(operator.to_string());
            if let Err(e) = self.dispatcher.notify(&target, &Notice::text(text)).await {
                warn!("邀请处理结果通知失败: {}", e);
            }
        }

        /// 巡检一次：退出所有已加入的黑名单群，返回成功退出的数量
        pub async fn sweep_once(&self) -> Result<usize, GuardError> {
            let joined = self.dispatcher.joined_groups().await?;
            let targets: Vec<String> = {
                let list = self.store.read().await;
                joined
                    .into_iter()
                    .filter(|g| list.contains_group(g))
                    .collect()
            };

            let mut left = 0;
            for group_id in targets {
                if !self
                    .dispatcher
                    .dispatch(&Decision::Leave(group_id))
                    .await
                    .is_failed()
                {
                    left += 1;
                }
            }
            Ok(left)
        }

        /// 当前在该群中则立即退出
        pub async fn leave_if_joined(&self, group_id: &str) -> Result<bool, GuardError> {
            if !self.dispatcher.platform().supports_group_list() {
                return Ok(false);
            }
            let joined = self.dispatcher.joined_groups().await?;
            if !joined.iter().any(|g| g == group_id) {
                return Ok(false);
            }
            match self
                .dispatcher
                .dispatch(&Decision::Leave(group_id.to_string()))
                .await
            {
                Outcome::Failed(e) => Err(e),
                _ => Ok(true),
            }
        }
    }

}

// --- 定时巡检 ---
mod sweep {
    use super::guard::Guard;
    use super::platform::Platform;
    use kovi::log::{debug, error, info, warn};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// 按固定间隔退出已加入的黑名单群，直到 `cancel` 触发。单轮失败只记录日志。
    pub async fn run<P: Platform>(
        guard: Arc<Guard<P>>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        if !guard.dispatcher().platform().supports_group_list() {
            warn!("平台不支持获取群列表，黑名单巡检已关闭");
            return;
        }
        info!("黑名单巡检已启动，间隔 {} 秒", interval.as_secs());

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    info!("黑名单巡检已停止");
                    return;
                }
            }

            match guard.sweep_once().await {
                Ok(0) => debug!("巡检完成，无需退群"),
                Ok(n) => info!("巡检完成，已退出 {} 个黑名单群", n),
                Err(e) => error!("巡检失败，下个周期重试: {}", e),
            }
        }
    }

}

// --- 指令解析器 ---
mod parser {
    use super::types::ListKind;
    use regex::Regex;
    use std::ops::RangeInclusive;
    use std::sync::OnceLock;

    static RE_EN: OnceLock<Regex> = OnceLock::new();
    static RE_ZH_EDIT: OnceLock<Regex> = OnceLock::new();
    static RE_ZH_LIST: OnceLock<Regex> = OnceLock::new();

    /// QQ 号/群号的合法位数
    const ID_LEN: RangeInclusive<usize> = 5..=13;

    pub const USAGE: &str = "用法: blacklist add|remove user|group 号码 / blacklist list user|group\n\
        或: 添加黑名单群 群号 | 移除黑名单群 群号 | 添加黑名单用户 QQ号 | 移除黑名单用户 QQ号 | 黑名单列表 群/用户";

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum AdminCommand {
        Add(ListKind, String),
        Remove(ListKind, String),
        List(ListKind),
        /// 是黑名单指令但参数有误
        Usage,
    }

    /// 全角数字与空格转半角
    fn normalize(s: &str) -> String {
        s.chars()
            .map(|c| match c {
                '０'..='９' => char::from(b'0' + (c as u32 - '０' as u32) as u8),
                '　' => ' ',
                _ => c,
            })
            .collect()
    }

    fn is_id(s: &str) -> bool {
        ID_LEN.contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
    }

    fn build(op: &str, kind: ListKind, id: Option<&str>) -> AdminCommand {
        match (op, id) {
            ("list", None) => AdminCommand::List(kind),
            ("add", Some(id)) if is_id(id) => AdminCommand::Add(kind, id.to_string()),
            ("remove", Some(id)) if is_id(id) => AdminCommand::Remove(kind, id.to_string()),
            _ => AdminCommand::Usage,
        }
    }

    pub fn parse(raw: &str) -> Option<AdminCommand> {
        let norm = normalize(raw.trim());
        let text = norm.as_str();

        let en = RE_EN.get_or_init(|| {
            Regex::new(r"(?i)^blacklist\s+(add|remove|list)\s+(user|group)(?:\s+(\S+))?$").unwrap()
        });
        if let Some(c) = en.captures(text) {
            let op = c[1].to_ascii_lowercase();
            let kind = if c[2].eq_ignore_ascii_case("user") {
                ListKind::User
            } else {
                ListKind::Group
            };
            return Some(build(&op, kind, c.get(3).map(|m| m.as_str())));
        }
        if text
            .split_whitespace()
            .next()
            .is_some_and(|w| w.eq_ignore_ascii_case("blacklist"))
        {
            return Some(AdminCommand::Usage);
        }

        let zh_edit = RE_ZH_EDIT
            .get_or_init(|| Regex::new(r"^(添加|移除)黑名单(群|用户)\s*(\S*)$").unwrap());
        if let Some(c) = zh_edit.captures(text) {
            let op = if &c[1] == "添加" { "add" } else { "remove" };
            let kind = zh_kind(&c[2]);
            let id = c.get(3).map(|m| m.as_str()).filter(|s| !s.is_empty());
            return Some(match id {
                Some(id) => build(op, kind, Some(id)),
                None => AdminCommand::Usage,
            });
        }

        let zh_list =
            RE_ZH_LIST.get_or_init(|| Regex::new(r"^黑名单列表\s*(群|用户)?$").unwrap());
        if let Some(c) = zh_list.captures(text) {
            return Some(match c.get(1) {
                Some(m) => AdminCommand::List(zh_kind(m.as_str())),
                None => AdminCommand::Usage,
            });
        }

        None
    }

    fn zh_kind(s: &str) -> ListKind {
        if s == "群" {
            ListKind::Group
        } else {
            ListKind::User
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn english_commands() {
            assert_eq!(
                parse("blacklist add group 123456789"),
                Some(AdminCommand::Add(ListKind::Group, "123456789".into()))
            );
            assert_eq!(
                parse("  Blacklist REMOVE user 10001  "),
                Some(AdminCommand::Remove(ListKind::User, "10001".into()))
            );
            assert_eq!(
                parse("blacklist list user"),
                Some(AdminCommand::List(ListKind::User))
            );
        }

        #[test]
        fn chinese_aliases() {
            assert_eq!(
                parse("添加黑名单群 123456789"),
                Some(AdminCommand::Add(ListKind::Group, "123456789".into()))
            );
            assert_eq!(
                parse("移除黑名单用户12345"),
                Some(AdminCommand::Remove(ListKind::User, "12345".into()))
            );
            assert_eq!(parse("黑名单列表 群"), Some(AdminCommand::List(ListKind::Group)));
            assert_eq!(parse("黑名单列表"), Some(AdminCommand::Usage));
        }

        #[test]
        fn ids_keep_leading_zeros() {
            assert_eq!(
                parse("blacklist add user 0012345"),
                Some(AdminCommand::Add(ListKind::User, "0012345".into()))
            );
        }

        #[test]
        fn full_width_digits_are_normalized() {
            assert_eq!(
                parse("添加黑名单群　１２３４５６"),
                Some(AdminCommand::Add(ListKind::Group, "123456".into()))
            );
        }

        #[test]
        fn bad_arguments_yield_usage() {
            assert_eq!(parse("blacklist add user"), Some(AdminCommand::Usage));
            assert_eq!(parse("blacklist add user abc123"), Some(AdminCommand::Usage));
            assert_eq!(parse("blacklist add user 1234"), Some(AdminCommand::Usage));
            assert_eq!(parse("blacklist add 123456"), Some(AdminCommand::Usage));
            assert_eq!(parse("blacklist list group 123456"), Some(AdminCommand::Usage));
            assert_eq!(parse("添加黑名单群"), Some(AdminCommand::Usage));
        }

        #[test]
        fn unrelated_text_is_ignored() {
            assert_eq!(parse("hello"), None);
            assert_eq!(parse("blacklisted users are sad"), None);
            assert_eq!(parse("入群 123456"), None);
        }
    }
}

// --- 管理指令 ---
mod commands {
    use super::guard::Guard;
    use super::parser::{AdminCommand, USAGE};
    use super::platform::Platform;
    use super::types::{ListKind, Mutation};
    use kovi::log::{info, warn};

    /// 执行管理指令，返回回复给管理员的文本
    pub async fn execute<P: Platform>(guard: &Guard<P>, cmd: AdminCommand) -> String {
        match cmd {
            AdminCommand::Usage => format!("❌ 格式错误\n{}", USAGE),
            AdminCommand::List(kind) => {
                let ids = guard.store().list(kind).await;
                if ids.is_empty() {
                    format!("📋 {}黑名单为空", kind)
                } else {
                    format!("📋 {}黑名单（{}）:\n{}", kind, ids.len(), ids.join("\n"))
                }
            }
            AdminCommand::Add(kind, id) => match guard.store().add(kind, &id).await {
                Ok(Mutation::AlreadyPresent) => format!("⚠️ {} {} 已在黑名单中", kind, id),
                Ok(_) => {
                    info!("管理员添加黑名单{}: {}", kind, id);
                    let mut reply = format!("✅ 已将{} {} 加入黑名单", kind, id);
                    if kind == ListKind::Group {
                        match guard.leave_if_joined(&id).await {
                            Ok(true) => reply.push_str("，并已退出该群"),
                            Ok(false) => {}
                            Err(e) => reply.push_str(&format!("，但退群失败: {}", e)),
                        }
                    }
                    reply
                }
                Err(e) => {
                    warn!("添加黑名单{} {} 失败: {}", kind, id, e);
                    format!("❌ {}", e)
                }
            },
            AdminCommand::Remove(kind, id) => match guard.store().remove(kind, &id).await {
                Ok(Mutation::NotFound) => format!("⚠️ {} {} 不在黑名单中", kind, id),
                Ok(_) => {
                    info!("管理员移除黑名单{}: {}", kind, id);
                    format!("✅ 已将{} {} 移出黑名单", kind, id)
                }
                Err(e) => {
                    warn!("移除黑名单{} {} 失败: {}", kind, id, e);
                    format!("❌ {}", e)
                }
            },
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::testing::{Call, RecordingPlatform, guard_with, guard_with_capacity};

        #[tokio::test]
        async fn add_list_remove_replies() {
            let (_dir, guard) = guard_with(RecordingPlatform::default(), None);
            let add = AdminCommand::Add(ListKind::User, "10001".into());

            assert_eq!(execute(&guard, add.clone()).await, "✅ 已将用户 10001 加入黑名单");
            assert_eq!(execute(&guard, add).await, "⚠️ 用户 10001 已在黑名单中");
            assert_eq!(
                execute(&guard, AdminCommand::List(ListKind::User)).await,
                "📋 用户黑名单（1）:\n10001"
            );
            assert_eq!(
                execute(&guard, AdminCommand::Remove(ListKind::User, "10001".into())).await,
                "✅ 已将用户 10001 移出黑名单"
            );
            assert_eq!(
                execute(&guard, AdminCommand::Remove(ListKind::User, "10001".into())).await,
                "⚠️ 用户 10001 不在黑名单中"
            );
            assert_eq!(
                execute(&guard, AdminCommand::List(ListKind::User)).await,
                "📋 用户黑名单为空"
            );
        }

        #[tokio::test]
        async fn adding_joined_group_leaves_it() {
            let platform = RecordingPlatform {
                joined: vec!["123456".into()],
                ..RecordingPlatform::default()
            };
            let (_dir, guard) = guard_with(platform, None);
            let reply = execute(&guard, AdminCommand::Add(ListKind::Group, "123456".into())).await;
            assert_eq!(reply, "✅ 已将群 123456 加入黑名单，并已退出该群");
            assert_eq!(
                guard.dispatcher().platform().calls().last(),
                Some(&Call::Leave("123456".into()))
            );
        }

        #[tokio::test]
        async fn capacity_error_is_reported() {
            let (_dir, guard) = guard_with_capacity(RecordingPlatform::default(), 1);
            execute(&guard, AdminCommand::Add(ListKind::Group, "11111".into())).await;
            let reply = execute(&guard, AdminCommand::Add(ListKind::Group, "22222".into())).await;
            assert_eq!(reply, "❌ 群黑名单已满（上限 1）");
        }
    }
}

// --- OneBot 适配 ---
mod onebot {
    use super::platform::Platform;
    use super::types::{InboundEvent, Invite, Notice, Target};
    use anyhow::{Context, anyhow};
    use kovi::bot::message::Message;
    use kovi::log::debug;
    use kovi::serde_json::{Value, json};
    use kovi::bot::runtimebot::CanSendApi;
    use kovi::event::AdminMsgEvent;
    use kovi::{MsgEvent, RuntimeBot};
    use std::sync::Arc;

    pub struct KoviPlatform {
        bot: Arc<RuntimeBot>,
        group_list: bool,
    }

    impl KoviPlatform {
        /// 启动时试调一次 get_group_list，不可用时平台不提供群列表
        pub async fn connect(bot: Arc<RuntimeBot>) -> Self {
            let mut platform = Self {
                bot,
                group_list: false,
            };
            let answer = platform.call("get_group_list", json!({})).await;
            platform.group_list = group_list_supported(&answer);
            if let Err(e) = &answer {
                debug!("get_group_list 不可用: {}", e);
            }
            platform
        }

        async fn call(&self, action: &str, params: Value) -> anyhow::Result<Value> {
            self.bot
                .send_api_return(action, params)
                .await
                .map(|r| r.data)
                .map_err(|r| anyhow!("{} 返回错误: {:?}", action, r))
        }
    }

    fn group_list_supported(answer: &anyhow::Result<Value>) -> bool {
        matches!(answer, Ok(data) if data.is_array())
    }

    /// OneBot 接口要求数字号码，只在这里转换
    fn numeric(id: &str) -> anyhow::Result<i64> {
        id.parse()
            .with_context(|| format!("无效的号码: {}", id))
    }

    impl Platform for KoviPlatform {
        async fn answer_invite(
            &self,
            token: &str,
            approve: bool,
            reason: Option<&str>,
        ) -> anyhow::Result<()> {
            let mut params = json!({
                "flag": token,
                "sub_type": "invite",
                "approve": approve,
            });
            if let Some(r) = reason {
                params["reason"] = json!(r);
            }
            self.call("set_group_add_request", params).await.map(drop)
        }

        async fn leave_group(&self, group_id: &str) -> anyhow::Result<()> {
            let params = json!({ "group_id": numeric(group_id)? });
            self.call("set_group_leave", params).await.map(drop)
        }

        async fn send_message(&self, target: &Target, notice: &Notice) -> anyhow::Result<()> {
            let message = to_message(notice);
            let (action, params) = match target {
                Target::Group(id) => (
                    "send_group_msg",
                    json!({ "group_id": numeric(id)?, "message": message }),
                ),
                Target::User(id) => (
                    "send_private_msg",
                    json!({ "user_id": numeric(id)?, "message": message }),
                ),
            };
            self.call(action, params).await.map(drop)
        }

        async fn list_joined_groups(&self) -> anyhow::Result<Vec<String>> {
            let data = self.call("get_group_list", json!({})).await?;
            Ok(group_ids(&data))
        }

        fn supports_group_list(&self) -> bool {
            self.group_list
        }
    }

    fn to_message(notice: &Notice) -> Message {
        let msg = Message::new();
        let msg = match &notice.mention {
            Some(id) => msg.add_at(id),
            None => msg,
        };
        msg.add_text(notice.text.as_str())
    }

    pub fn reply_text(event: &Arc<AdminMsgEvent>, text: impl Into<String>) {
        event.reply(
            Message::new()
                .add_reply(event.message_id)
                .add_text(text.into()),
        );
    }

    /// 数字号码取十进制文本，字符串号码原样保留
    pub fn id_of(v: &Value) -> Option<String> {
        match v {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    pub fn group_ids(data: &Value) -> Vec<String> {
        data.as_array()
            .map(|groups| groups.iter().filter_map(|g| id_of(&g["group_id"])).collect())
            .unwrap_or_default()
    }

    /// 从原始请求事件中提取入群邀请，其余请求返回 None
    pub fn invite_from_json(raw: &Value) -> Option<InboundEvent> {
        if raw["request_type"] != "group" || raw["sub_type"] != "invite" {
            return None;
        }
        Some(InboundEvent::GroupInvite(Invite {
            group_id: id_of(&raw["group_id"])?,
            inviter_id: id_of(&raw["user_id"])?,
            token: raw["flag"]
                .as_str()
                .filter(|f| !f.is_empty())
                .map(str::to_string),
        }))
    }

    pub fn message_event(event: &MsgEvent) -> Option<InboundEvent> {
        inbound_message(event.self_id, event.user_id, event.group_id)
    }

    /// 机器人自己发出的消息返回 None
    fn inbound_message(self_id: i64, user_id: i64, group_id: Option<i64>) -> Option<InboundEvent> {
        if user_id == self_id {
            return None;
        }
        let sender_id = user_id.to_string();
        Some(match group_id {
            Some(group_id) => InboundEvent::GroupMessage {
                sender_id,
                group_id: group_id.to_string(),
            },
            None => InboundEvent::PrivateMessage { sender_id },
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn group_invite_is_extracted() {
            let raw = json!({
                "post_type": "request",
                "request_type": "group",
                "sub_type": "invite",
                "group_id": 123456789,
                "user_id": 10001,
                "flag": "abc",
            });
            assert_eq!(
                invite_from_json(&raw),
                Some(InboundEvent::GroupInvite(Invite {
                    group_id: "123456789".into(),
                    inviter_id: "10001".into(),
                    token: Some("abc".into()),
                }))
            );
        }

        #[test]
        fn missing_flag_yields_tokenless_invite() {
            let raw = json!({
                "request_type": "group",
                "sub_type": "invite",
                "group_id": "00123",
                "user_id": 5,
                "flag": "",
            });
            let Some(InboundEvent::GroupInvite(invite)) = invite_from_json(&raw) else {
                panic!("expected invite");
            };
            assert_eq!(invite.token, None);
            assert_eq!(invite.group_id, "00123");
        }

        #[test]
        fn other_requests_are_ignored() {
            let add = json!({"request_type": "group", "sub_type": "add", "group_id": 1, "user_id": 2, "flag": "f"});
            let friend = json!({"request_type": "friend", "user_id": 2, "flag": "f"});
            assert_eq!(invite_from_json(&add), None);
            assert_eq!(invite_from_json(&friend), None);
        }

        #[test]
        fn group_list_ids() {
            let data = json!([
                {"group_id": 111111, "group_name": "a"},
                {"group_id": "222222"},
                {"group_name": "no id"},
            ]);
            assert_eq!(group_ids(&data), vec!["111111", "222222"]);
            assert!(group_ids(&json!(null)).is_empty());
        }

        #[test]
        fn numeric_rejects_non_digits() {
            assert_eq!(numeric("123").unwrap(), 123);
            assert!(numeric("12a").is_err());
        }

        #[test]
        fn own_messages_are_skipped() {
            assert_eq!(inbound_message(42, 42, Some(123456)), None);
            assert_eq!(inbound_message(42, 42, None), None);
        }

        #[test]
        fn group_and_private_messages() {
            assert_eq!(
                inbound_message(42, 10001, Some(123456)),
                Some(InboundEvent::GroupMessage {
                    sender_id: "10001".into(),
                    group_id: "123456".into(),
                })
            );
            assert_eq!(
                inbound_message(42, 10001, None),
                Some(InboundEvent::PrivateMessage {
                    sender_id: "10001".into()
                })
            );
        }

        #[test]
        fn mention_comes_before_text() {
            let value = kovi::serde_json::to_value(to_message(&Notice::mention("10001", "hi")))
                .unwrap();
            let segments = value.as_array().unwrap();
            assert_eq!(segments.len(), 2);
            assert_eq!(segments[0]["type"], "at");
            assert_eq!(segments[0]["data"]["qq"], "10001");
            assert_eq!(segments[1]["type"], "text");
            assert_eq!(segments[1]["data"]["text"], "hi");

            let plain = kovi::serde_json::to_value(to_message(&Notice::text("hi"))).unwrap();
            assert_eq!(plain.as_array().unwrap().len(), 1);
            assert_eq!(plain[0]["type"], "text");
        }

        #[test]
        fn group_list_support_needs_an_array() {
            assert!(group_list_supported(&Ok(json!([]))));
            assert!(group_list_supported(&Ok(json!([{"group_id": 1}]))));
            assert!(!group_list_supported(&Ok(json!(null))));
            assert!(!group_list_supported(&Err(anyhow!("get_group_list 返回错误"))));
        }
    }
}


// --- 入口 ---
use crate::onebot::reply_text;
use crate::types::Propagation;
use kovi::PluginBuilder;
use kovi::log::{debug, error, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[kovi::plugin]
async fn main() {
    let bot = PluginBuilder::get_runtime_bot();
    let dir = bot.get_data_path();
    let config = config::Config::load(&dir);
    let store = store::Store::load(&dir, config.max_entries);
    let operator = bot.get_main_admin().ok().map(|id| id.to_string());
    let platform = onebot::KoviPlatform::connect(bot.clone()).await;
    let guard = Arc::new(guard::Guard::new(
        store,
        dispatch::Dispatcher::new(platform, config),
        operator,
    ));

    let cancel = CancellationToken::new();
    if let Some(interval) = guard.config().sweep_interval() {
        kovi::tokio::spawn(sweep::run(guard.clone(), interval, cancel.clone()));
    }

    let g = guard.clone();
    PluginBuilder::on_all_request(move |event| {
        let guard = g.clone();
        async move {
            let Some(invite) = onebot::invite_from_json(&event.original_json) else {
                debug!("忽略非入群邀请的请求事件");
                return;
            };
            guard.handle(&invite).await;
        }
    });

    let g = guard.clone();
    PluginBuilder::on_msg(move |event| {
        let guard = g.clone();
        async move {
            let Some(inbound) = onebot::message_event(&event) else {
                return;
            };
            if guard.handle(&inbound).await.propagation() == Propagation::Stop {
                debug!("消息 {} 已被拦截", event.message_id);
            }
        }
    });

    let g = guard.clone();
    PluginBuilder::on_admin_msg(move |event| {
        let guard = g.clone();
        async move {
            let Some(cmd) = event.borrow_text().and_then(parser::parse) else {
                return;
            };
            let reply = commands::execute(&guard, cmd).await;
            reply_text(&event, reply);
        }
    });

    PluginBuilder::drop({
        move || {
            let guard = guard.clone();
            let cancel = cancel.clone();
            async move {
                cancel.cancel();
                // 保存黑名单
                if let Err(e) = guard.store().save().await {
                    error!("卸载时保存黑名单失败: {}", e);
                }
                info!("插件已卸载");
            }
        }
    });
}
