//! Follower/tweet example domain.
//!
//! Accounts and tweets are cached entities; follower rows are plain records.
//! Two memoized computations hang off the follower relation: an account's
//! follower count, and whether two accounts follow each other.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{
    CacheEntity, CacheKey, CacheMachine, CacheRegistry, CachedRef, CachedRepository, Memoized,
    Repository,
};
use crate::error::CacheError;
use crate::store::{EntityId, Filter, MemoryStore, Record};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Option<EntityId>,
    pub username: String,
    /// Set once the instance has been written to or read from cache.
    #[serde(default)]
    pub cached: bool,
}

impl Account {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: None,
            username: username.into(),
            cached: false,
        }
    }
}

impl Record for Account {
    const TYPE_NAME: &'static str = "followers.Account";

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn field(&self, name: &str) -> Option<String> {
        (name == "username").then(|| self.username.clone())
    }
}

impl CacheEntity for Account {
    fn mark_cached(&mut self) {
        self.cached = true;
    }
}

/// `followed_by` follows `account`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Follower {
    pub id: Option<EntityId>,
    pub account: EntityId,
    pub followed_by: EntityId,
}

impl Record for Follower {
    const TYPE_NAME: &'static str = "followers.Follower";

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "account" => Some(self.account.to_string()),
            "followed_by" => Some(self.followed_by.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tweet {
    pub id: Option<EntityId>,
    pub text: String,
    pub created_by: CachedRef<Account>,
}

impl Record for Tweet {
    const TYPE_NAME: &'static str = "followers.Tweet";

    fn id(&self) -> Option<EntityId> {
        self.id
    }

    fn assign_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    fn field(&self, name: &str) -> Option<String> {
        match name {
            "text" => Some(self.text.clone()),
            "created_by" => self.created_by.id().map(|id| id.to_string()),
            _ => None,
        }
    }
}

impl CacheEntity for Tweet {
    fn clear_references(&mut self) {
        self.created_by.clear();
    }
}

/// Observations from [`Tweeter::run_scenario`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioReport {
    pub followers_before: u64,
    pub followers_after: u64,
    pub mutual_before: bool,
    pub mutual_after: bool,
    pub author_before: String,
    pub author_after: String,
    pub account_queries: usize,
}

/// The example application: repositories plus memoized follower queries.
pub struct Tweeter {
    registry: Arc<CacheRegistry>,
    account_rows: Arc<MemoryStore<Account>>,
    follower_rows: Arc<MemoryStore<Follower>>,
    accounts: CachedRepository<Account>,
    followers: Repository<Follower>,
    tweets: CachedRepository<Tweet>,
    followers_count: Memoized<(EntityId,), u64>,
    mutual: Memoized<(EntityId, EntityId), bool>,
}

impl Tweeter {
    pub fn new(machine: Arc<CacheMachine>, registry: Arc<CacheRegistry>) -> Self {
        let account_rows = Arc::new(MemoryStore::<Account>::new());
        let follower_rows = Arc::new(MemoryStore::<Follower>::new());
        let tweet_rows = Arc::new(MemoryStore::<Tweet>::new());

        // Declared before the follower type exists; binds once the
        // follower repository defines it.
        let rows = follower_rows.clone();
        let mutual = Memoized::builder(
            "account::mutual::{}-{}",
            |&(a, b): &(EntityId, EntityId)| vec![a.to_string(), b.to_string()],
            move |&(a, b): &(EntityId, EntityId)| {
                let follows = |from: EntityId, to: EntityId| {
                    rows.count_where(|row| row.followed_by == from && row.account == to) > 0
                };
                Ok(follows(a, b) && follows(b, a))
            },
        )
        .watch_named("followers.Follower", |row: &Follower| {
            (row.followed_by, row.account)
        })
        .symmetrical()
        .build(machine.clone(), &registry);

        let followers = Repository::new(follower_rows.clone(), registry.clone());

        let rows = follower_rows.clone();
        let followers_count = Memoized::builder(
            "account::followers::account-id-{}",
            |&(id,): &(EntityId,)| vec![id.to_string()],
            move |&(id,): &(EntityId,)| Ok(rows.count_where(|row| row.account == id) as u64),
        )
        .watch::<Follower, _>(|row: &Follower| (row.account,))
        .build(machine.clone(), &registry);

        registry.register_key_builder(Account::TYPE_NAME, "username", |value| {
            CacheKey::new(format!("{}::username::{value}", Account::TYPE_NAME))
        });

        let accounts =
            CachedRepository::new(machine.clone(), registry.clone(), account_rows.clone());
        let tweets = CachedRepository::new(machine, registry.clone(), tweet_rows);

        Self {
            registry,
            account_rows,
            follower_rows,
            accounts,
            followers,
            tweets,
            followers_count,
            mutual,
        }
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    pub fn accounts(&self) -> &CachedRepository<Account> {
        &self.accounts
    }

    pub fn followers(&self) -> &Repository<Follower> {
        &self.followers
    }

    pub fn tweets(&self) -> &CachedRepository<Tweet> {
        &self.tweets
    }

    pub fn account_rows(&self) -> &Arc<MemoryStore<Account>> {
        &self.account_rows
    }

    pub fn follower_rows(&self) -> &Arc<MemoryStore<Follower>> {
        &self.follower_rows
    }

    pub fn followers_count_memo(&self) -> &Memoized<(EntityId,), u64> {
        &self.followers_count
    }

    pub fn mutual_memo(&self) -> &Memoized<(EntityId, EntityId), bool> {
        &self.mutual
    }

    pub fn create_account(&self, username: &str) -> Result<Account, CacheError> {
        let mut account = Account::new(username);
        self.accounts.save(&mut account)?;
        Ok(account)
    }

    pub fn account(&self, id: EntityId) -> Result<Account, CacheError> {
        self.accounts.get(&Filter::id(id))
    }

    pub fn account_by_username(&self, username: &str) -> Result<Account, CacheError> {
        self.accounts.get(&Filter::by("username", username))
    }

    /// `from` starts following `to`.
    pub fn follow(&self, from: &Account, to: &Account) -> Result<Follower, CacheError> {
        let mut row = Follower {
            id: None,
            account: saved_id(to)?,
            followed_by: saved_id(from)?,
        };
        self.followers.save(&mut row)?;
        Ok(row)
    }

    pub fn unfollow(&self, row: &Follower) -> Result<(), CacheError> {
        self.followers.delete(row)
    }

    pub fn post_tweet(&self, author: &Account, text: &str) -> Result<Tweet, CacheError> {
        saved_id(author)?;
        let mut tweet = Tweet {
            id: None,
            text: text.to_string(),
            created_by: CachedRef::to(author),
        };
        self.tweets.save(&mut tweet)?;
        Ok(tweet)
    }

    pub fn tweet(&self, id: EntityId) -> Result<Tweet, CacheError> {
        self.tweets.get(&Filter::id(id))
    }

    /// Resolve the tweet's author through the account cache.
    pub fn tweet_author(&self, tweet: &mut Tweet) -> Result<Account, CacheError> {
        tweet
            .created_by
            .resolve(self.accounts.cache())?
            .cloned()
            .ok_or_else(|| CacheError::not_found(Account::TYPE_NAME))
    }

    pub fn followers_count(&self, account: &Account) -> Result<u64, CacheError> {
        self.followers_count.call(&(saved_id(account)?,))
    }

    pub fn are_mutual(&self, a: &Account, b: &Account) -> Result<bool, CacheError> {
        self.mutual.call(&(saved_id(a)?, saved_id(b)?))
    }

    /// Tom follows Andy, Ann and Leslie; Andy then follows Leslie and
    /// Leslie follows Tom back; Tom renames himself.
    pub fn run_scenario(&self) -> Result<ScenarioReport, CacheError> {
        let mut tom = self.create_account("tom")?;
        let andy = self.create_account("andy")?;
        let ann = self.create_account("ann")?;
        let leslie = self.create_account("leslie")?;

        for followed in [&andy, &ann, &leslie] {
            self.follow(&tom, followed)?;
        }
        let tweet = self.post_tweet(&tom, "Tweet!!!")?;
        let tweet_id = saved_id(&tweet)?;

        let followers_before = self.followers_count(&leslie)?;
        let mutual_before = self.are_mutual(&leslie, &tom)?;
        let author_before = self.tweet_author(&mut self.tweet(tweet_id)?)?.username;

        self.follow(&andy, &leslie)?;
        self.follow(&leslie, &tom)?;
        tom.username = "tom haverford".to_string();
        self.accounts.save(&mut tom)?;

        let followers_after = self.followers_count(&leslie)?;
        let mutual_after = self.are_mutual(&tom, &leslie)?;
        let author_after = self.tweet_author(&mut self.tweet(tweet_id)?)?.username;

        let report = ScenarioReport {
            followers_before,
            followers_after,
            mutual_before,
            mutual_after,
            author_before,
            author_after,
            account_queries: self.account_rows.query_count(),
        };
        info!(?report, "Scenario finished");
        Ok(report)
    }
}

fn saved_id<E: Record>(entity: &E) -> Result<EntityId, CacheError> {
    entity
        .id()
        .ok_or_else(|| CacheError::misuse(format!("`{}` has not been saved", E::TYPE_NAME)))
}
