//! Document store 3 -> 4: nested class participants, activity flags, and
//! gameplays carrying their player's identity and attempt history.

use std::collections::{BTreeMap, BTreeSet};

use analytics_storage::{Document, DocumentStore, document_id};
use rand::seq::SliceRandom;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::{
    config::MigrationConfig,
    error::PhaseError,
    transformer::{Transformer, TransformerDescriptor},
    transformers::{
        collections::{
            backup_collections, collections_with_prefix, drop_backups, restore_collections,
        },
        documents_v2::CLASSES,
        documents_v3::ACTIVITIES,
    },
    version::StoreKind,
};

pub const GAMES: &str = "games";
pub const PLAYERS: &str = "players";
pub const AUTH_TOKENS: &str = "authtokens";
/// One collection per game version: `gameplays_<versionId>`.
pub const GAMEPLAYS_PREFIX: &str = "gameplays_";

const DEFAULT_PLAYER_TYPE: &str = "anonymous";

const ADJECTIVES: [&str; 12] = [
    "Brave", "Calm", "Clever", "Eager", "Gentle", "Happy", "Jolly", "Lucky", "Mighty", "Quiet",
    "Swift", "Witty",
];
const ANIMALS: [&str; 12] = [
    "Badger", "Beaver", "Dolphin", "Falcon", "Fox", "Koala", "Lynx", "Otter", "Owl", "Panda",
    "Tiger", "Walrus",
];

#[derive(Debug)]
pub struct ParticipantsAndAttempts {
    descriptor: TransformerDescriptor,
}

impl Default for ParticipantsAndAttempts {
    fn default() -> Self {
        Self {
            descriptor: TransformerDescriptor::new(StoreKind::Documents, 3, 4),
        }
    }
}

/// Display name for players that never got one.
pub fn generate_animal_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Brave");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("Otter");
    format!("{adjective}{animal}")
}

fn take_list(document: &mut Document, field: &str) -> Value {
    match document.remove(field) {
        Some(Value::Array(values)) => Value::Array(values),
        _ => json!([]),
    }
}

/// Moves the flat `teachers`/`students` lists into `participants`. Members
/// already listed in an existing `participants` object are kept, each member
/// appears once per role.
fn nest_participants(class: &mut Document) {
    let flat = [
        ("teachers", take_list(class, "teachers")),
        ("students", take_list(class, "students")),
        ("assistants", json!([])),
    ];
    let mut participants = match class.remove("participants") {
        Some(Value::Object(participants)) => participants,
        _ => Map::new(),
    };
    for (role, members) in flat {
        let mut merged = match participants.remove(role) {
            Some(Value::Array(existing)) => existing,
            _ => Vec::new(),
        };
        if let Value::Array(members) = members {
            for member in members {
                if !merged.contains(&member) {
                    merged.push(member);
                }
            }
        }
        participants.insert(role.to_owned(), Value::Array(merged));
    }
    class.insert("participants".to_owned(), Value::Object(participants));
}

fn ensure_list(document: &mut Document, field: &str) {
    if !document.get(field).is_some_and(Value::is_array) {
        document.insert(field.to_owned(), json!([]));
    }
}

fn is_list(document: &Document, field: &str) -> bool {
    document.get(field).is_some_and(Value::is_array)
}

fn has_end(activity: &Document) -> bool {
    activity.get("end").is_some_and(|end| !end.is_null())
}

fn id_of(document: &Document) -> String {
    document_id(document).unwrap_or_default().to_owned()
}

fn malformed(collection: &str, document: &Document, reason: impl Into<String>) -> PhaseError {
    PhaseError::MalformedDocument {
        collection: collection.to_owned(),
        id: id_of(document),
        reason: reason.into(),
    }
}

/// Fields copied from a player onto each of its gameplays.
fn player_identity(player: &Document) -> [(&'static str, Value); 3] {
    [
        (
            "playerName",
            player.get("name").cloned().unwrap_or(Value::Null),
        ),
        (
            "playerType",
            player
                .get("type")
                .cloned()
                .unwrap_or_else(|| json!(DEFAULT_PLAYER_TYPE)),
        ),
        (
            "animalName",
            player.get("animalName").cloned().unwrap_or(Value::Null),
        ),
    ]
}

type TokenKey = (String, String);

/// Auth tokens grouped by `(playerId, gameplayId)`, ordered by session number.
fn group_tokens(tokens: Vec<Document>) -> BTreeMap<TokenKey, Vec<Document>> {
    let mut grouped: BTreeMap<TokenKey, Vec<Document>> = BTreeMap::new();
    for token in tokens {
        let (Some(player), Some(gameplay)) = (
            token.get("playerId").and_then(Value::as_str),
            token.get("gameplayId").and_then(Value::as_str),
        ) else {
            warn!(token = %id_of(&token), "Auth token without player or gameplay, ignoring");
            continue;
        };
        grouped
            .entry((player.to_owned(), gameplay.to_owned()))
            .or_default()
            .push(token);
    }
    for tokens in grouped.values_mut() {
        tokens.sort_by_key(|token| token.get("session").and_then(Value::as_u64).unwrap_or(0));
    }
    grouped
}

fn token_value(token: &Document) -> Value {
    token
        .get("authToken")
        .cloned()
        .unwrap_or_else(|| json!(id_of(token)))
}

fn attempt_from_token(token: &Document) -> Value {
    json!({
        "number": token.get("session").cloned().unwrap_or(Value::Null),
        "authToken": token_value(token),
        "start": token.get("started").cloned().unwrap_or(Value::Null),
        "end": token.get("ended").cloned().unwrap_or(Value::Null),
    })
}

fn gameplay_player_id<'a>(
    collection: &str,
    gameplay: &'a Document,
) -> Result<&'a str, PhaseError> {
    gameplay
        .get("playerId")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(collection, gameplay, "gameplay has no playerId"))
}

async fn load_by_id(
    store: &DocumentStore,
    collection: &str,
) -> Result<BTreeMap<String, Document>, PhaseError> {
    Ok(store
        .find_all(collection)
        .await?
        .into_iter()
        .map(|document| (id_of(&document), document))
        .collect())
}

impl ParticipantsAndAttempts {
    async fn upgrade_classes(&self, store: &DocumentStore) -> Result<(), PhaseError> {
        let classes = store.find_all(CLASSES).await?;
        let total = classes.len();
        for mut class in classes {
            nest_participants(&mut class);
            ensure_list(&mut class, "groups");
            ensure_list(&mut class, "groupings");
            store.replace(CLASSES, class).await?;
        }
        info!(classes = total, "Nested class participants");

        for mut game in store.find_all(GAMES).await? {
            if !game.contains_key("deleted") {
                game.insert("deleted".to_owned(), json!(false));
                store.replace(GAMES, game).await?;
            }
        }
        Ok(())
    }

    async fn upgrade_activities(&self, store: &DocumentStore) -> Result<(), PhaseError> {
        let activities = store.find_all(ACTIVITIES).await?;
        let total = activities.len();
        for mut activity in activities {
            let open = !has_end(&activity);
            activity.insert("open".to_owned(), json!(open));
            activity.insert("visible".to_owned(), json!(true));
            ensure_list(&mut activity, "groups");
            ensure_list(&mut activity, "groupings");
            store.replace(ACTIVITIES, activity).await?;
        }
        info!(activities = total, "Derived activity flags");
        Ok(())
    }

    async fn upgrade_gameplays(
        &self,
        store: &DocumentStore,
        collections: &[String],
    ) -> Result<(), PhaseError> {
        let mut players = load_by_id(store, PLAYERS).await?;
        let tokens = group_tokens(store.find_all(AUTH_TOKENS).await?);
        let mut dirty_players = BTreeSet::new();

        for collection in collections {
            let version_id = collection.trim_start_matches(GAMEPLAYS_PREFIX);
            let gameplays = store.find_all(collection).await?;
            let total = gameplays.len();
            for mut gameplay in gameplays {
                let player_id = gameplay_player_id(collection, &gameplay)?.to_owned();
                let player = players.get_mut(&player_id).ok_or_else(|| {
                    malformed(collection, &gameplay, format!("unknown player {player_id}"))
                })?;

                if !player.get("animalName").is_some_and(Value::is_string) {
                    player.insert("animalName".to_owned(), json!(generate_animal_name()));
                    dirty_players.insert(player_id.clone());
                }
                let versions = player
                    .entry("versions")
                    .or_insert_with(|| json!([]));
                if !versions.is_array() {
                    *versions = json!([]);
                }
                if let Value::Array(versions) = versions
                    && !versions.iter().any(|v| v.as_str() == Some(version_id))
                {
                    versions.push(json!(version_id));
                    dirty_players.insert(player_id.clone());
                }

                for (field, value) in player_identity(player) {
                    gameplay.insert(field.to_owned(), value);
                }
                let attempts: Vec<Value> = tokens
                    .get(&(player_id.clone(), id_of(&gameplay)))
                    .map(|tokens| tokens.iter().map(attempt_from_token).collect())
                    .unwrap_or_default();
                gameplay.insert("attempts".to_owned(), Value::Array(attempts));
                store.replace(collection, gameplay).await?;
            }
            info!(%collection, gameplays = total, "Denormalized gameplays");
        }

        for player_id in dirty_players {
            if let Some(player) = players.remove(&player_id) {
                store.replace(PLAYERS, player).await?;
            }
        }
        Ok(())
    }

    async fn check_gameplays(
        &self,
        store: &DocumentStore,
        collections: &[String],
    ) -> Result<(), PhaseError> {
        let players = load_by_id(store, PLAYERS).await?;
        let tokens = group_tokens(store.find_all(AUTH_TOKENS).await?);

        for collection in collections {
            let version_id = collection.trim_start_matches(GAMEPLAYS_PREFIX);
            for gameplay in store.find_all(collection).await? {
                let gameplay_id = id_of(&gameplay);
                let player_id = gameplay_player_id(collection, &gameplay)?;
                let Some(player) = players.get(player_id) else {
                    return Err(PhaseError::postcondition(format!(
                        "gameplay {collection}/{gameplay_id} points to missing player {player_id}"
                    )));
                };
                for (field, expected) in player_identity(player) {
                    if gameplay.get(field) != Some(&expected) {
                        return Err(PhaseError::postcondition(format!(
                            "gameplay {collection}/{gameplay_id} has {field} {:?}, player has {expected}",
                            gameplay.get(field)
                        )));
                    }
                }
                if !player.get("animalName").is_some_and(Value::is_string) {
                    return Err(PhaseError::postcondition(format!(
                        "player {player_id} has no animal name"
                    )));
                }
                let plays_version = player
                    .get("versions")
                    .and_then(Value::as_array)
                    .is_some_and(|versions| versions.iter().any(|v| v.as_str() == Some(version_id)));
                if !plays_version {
                    return Err(PhaseError::postcondition(format!(
                        "player {player_id} does not list version {version_id}"
                    )));
                }

                let Some(attempts) = gameplay.get("attempts").and_then(Value::as_array) else {
                    return Err(PhaseError::postcondition(format!(
                        "gameplay {collection}/{gameplay_id} has no attempts"
                    )));
                };
                if let Some(sessions) = gameplay.get("sessions").and_then(Value::as_u64)
                    && attempts.len() as u64 != sessions
                {
                    return Err(PhaseError::postcondition(format!(
                        "gameplay {collection}/{gameplay_id} has {} attempt(s) for {sessions} session(s)",
                        attempts.len()
                    )));
                }
                let expected_tokens: Vec<Value> = tokens
                    .get(&(player_id.to_owned(), gameplay_id.clone()))
                    .map(|tokens| tokens.iter().map(token_value).collect())
                    .unwrap_or_default();
                let actual_tokens: Vec<Value> = attempts
                    .iter()
                    .map(|attempt| attempt.get("authToken").cloned().unwrap_or(Value::Null))
                    .collect();
                if actual_tokens != expected_tokens {
                    return Err(PhaseError::postcondition(format!(
                        "gameplay {collection}/{gameplay_id} attempts do not match its auth tokens"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transformer for ParticipantsAndAttempts {
    fn descriptor(&self) -> &TransformerDescriptor {
        &self.descriptor
    }

    async fn backup(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let mut touched: Vec<String> = [CLASSES, GAMES, ACTIVITIES, PLAYERS]
            .into_iter()
            .map(str::to_owned)
            .collect();
        touched.extend(collections_with_prefix(&config.documents, GAMEPLAYS_PREFIX).await?);
        config.state.collections =
            backup_collections(&config.documents, self.descriptor.origin, &touched).await?;
        Ok(())
    }

    async fn upgrade(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let store = &config.documents;
        self.upgrade_classes(store).await?;
        self.upgrade_activities(store).await?;
        let gameplays = collections_with_prefix(store, GAMEPLAYS_PREFIX).await?;
        self.upgrade_gameplays(store, &gameplays).await
    }

    async fn check(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        let store = &config.documents;
        for class in store.find_all(CLASSES).await? {
            let participants = class.get("participants").and_then(Value::as_object);
            let nested = participants.is_some_and(|p| {
                ["teachers", "students", "assistants"]
                    .iter()
                    .all(|role| p.get(*role).is_some_and(Value::is_array))
            });
            let flat_left = class.contains_key("teachers") || class.contains_key("students");
            if !nested || flat_left || !is_list(&class, "groups") || !is_list(&class, "groupings")
            {
                return Err(PhaseError::postcondition(format!(
                    "class {} is not in the nested participants shape",
                    id_of(&class)
                )));
            }
        }
        for game in store.find_all(GAMES).await? {
            if !game.get("deleted").is_some_and(Value::is_boolean) {
                return Err(PhaseError::postcondition(format!(
                    "game {} has no deleted flag",
                    id_of(&game)
                )));
            }
        }
        for activity in store.find_all(ACTIVITIES).await? {
            let open_matches = activity.get("open") == Some(&json!(!has_end(&activity)));
            let visible = activity.get("visible").is_some_and(Value::is_boolean);
            if !open_matches
                || !visible
                || !is_list(&activity, "groups")
                || !is_list(&activity, "groupings")
            {
                return Err(PhaseError::postcondition(format!(
                    "activity {} has inconsistent flags",
                    id_of(&activity)
                )));
            }
        }
        let gameplays = collections_with_prefix(store, GAMEPLAYS_PREFIX).await?;
        self.check_gameplays(store, &gameplays).await
    }

    async fn clean(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        drop_backups(
            &config.documents,
            self.descriptor.origin,
            &config.state.collections,
        )
        .await?;
        Ok(())
    }

    async fn restore(&self, config: &mut MigrationConfig) -> Result<(), PhaseError> {
        restore_collections(
            &config.documents,
            self.descriptor.origin,
            &config.state.collections,
        )
        .await?;
        Ok(())
    }
}
