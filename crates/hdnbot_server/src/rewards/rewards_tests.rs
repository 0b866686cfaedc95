#![forbid(unsafe_code)]

use std::sync::Arc;

use hdnbot_domain::{ChoiceId, IncentiveId, RewardId};

use super::handlers::IncentiveVotes;
use super::*;
use crate::registry::DispatchReport;
use crate::store::MemoryStore;
use crate::testutil::{FakeCatalog, RecordingAnnouncer, denied_tokens, granted_tokens, identity, redemption};

struct Rig {
	sync: RewardSync,
	catalog: Arc<FakeCatalog>,
	store: Arc<MemoryStore>,
	registry: Arc<ListenerRegistry>,
	announcer: Arc<RecordingAnnouncer>,
	controls: Arc<RewardControls>,
}

fn rig_with(tokens: Arc<TokenManager>, store: Arc<MemoryStore>) -> Rig {
	let catalog = Arc::new(FakeCatalog::default());
	let controls = Arc::new(RewardControls::new(catalog.clone(), tokens, identity()));
	let registry = Arc::new(ListenerRegistry::new());
	let announcer = Arc::new(RecordingAnnouncer::default());
	let sync = RewardSync::new(
		Arc::clone(&controls),
		store.clone(),
		Arc::clone(&registry),
		announcer.clone(),
		RewardSettings::default(),
	);
	Rig {
		sync,
		catalog,
		store,
		registry,
		announcer,
		controls,
	}
}

async fn rig() -> Rig {
	let (tokens, _oauth, store) = granted_tokens().await;
	rig_with(tokens, store)
}

async fn tokenless_rig() -> Rig {
	rig_with(denied_tokens().await, Arc::new(MemoryStore::default()))
}

async fn seed_incentive(store: &MemoryStore, name: &str, max_votes: u32) -> IncentiveId {
	store
		.insert_incentive(NewIncentive {
			name,
			description: "desc",
			max_votes,
		})
		.await
		.unwrap()
}

async fn seed_choice(store: &MemoryStore, name: &str, options: &[&str]) -> ChoiceId {
	let id = store
		.insert_choice(NewChoice {
			name,
			description: "desc",
			has_open_entry: false,
		})
		.await
		.unwrap();
	for option in options {
		store.insert_option(id, option).await.unwrap();
	}
	id
}

fn bound(binding: &RewardBinding) -> RewardId {
	match binding.reward_id() {
		Some(id) => id.clone(),
		None => panic!("expected a bound reward, got: {binding:?}"),
	}
}

#[tokio::test]
async fn resync_is_idempotent() {
	let rig = rig().await;
	seed_incentive(&rig.store, "Emotes", 10).await;
	seed_choice(&rig.store, "Game", &["Chess", "Go"]).await;

	let first = rig.sync.resync().await.unwrap();
	assert_eq!(first.created, 3);
	assert_eq!(first.bound, 3);

	let second = rig.sync.resync().await.unwrap();
	assert_eq!(second, ResyncReport {
		bound: 3,
		..ResyncReport::default()
	});
	assert_eq!(rig.catalog.created.lock().len(), 3);
	assert!(rig.catalog.paused.lock().is_empty());

	let titles: Vec<String> = rig.catalog.created.lock().iter().map(|r| r.title.clone()).collect();
	assert!(titles.contains(&"Emotes".to_string()));
	assert!(titles.contains(&"Game - Chess".to_string()));
	assert!(titles.contains(&"Game - Go".to_string()));
}

#[tokio::test]
async fn resync_without_token_is_skipped() {
	let rig = tokenless_rig().await;
	seed_incentive(&rig.store, "Emotes", 10).await;

	let report = rig.sync.resync().await.unwrap();
	assert!(report.skipped);
	assert_eq!(report.created, 0);
	assert!(rig.catalog.created.lock().is_empty());
	assert!(rig.registry.is_empty());
}

#[tokio::test]
async fn resync_failure_is_reported() {
	let rig = rig().await;
	seed_incentive(&rig.store, "Emotes", 10).await;
	rig.catalog.fail_list.store(true, std::sync::atomic::Ordering::SeqCst);

	let err = rig.sync.resync().await.expect_err("catalog is down");
	assert!(format!("{err:#}").contains("list rewards"));
	assert!(rig.catalog.created.lock().is_empty());
}

#[tokio::test]
async fn missing_remote_reward_is_recreated() {
	let rig = rig().await;
	let incentive = rig.sync.create_incentive("Emotes", "new emotes", Some(10)).await.unwrap();
	let old = bound(&incentive.reward);

	rig.catalog.forget(&old);
	let report = rig.sync.resync().await.unwrap();
	assert_eq!(report.created, 1);

	let rebound = bound(&rig.store.incentive(incentive.id).await.unwrap().unwrap().reward);
	assert_ne!(rebound, old);
	assert!(rig.catalog.reward(&rebound).is_some());
	assert_eq!(rig.registry.listener_names(&rebound), vec![INCENTIVE_LISTENER.to_string()]);
	assert!(rig.registry.listener_names(&old).is_empty());
}

#[tokio::test]
async fn pause_state_follows_local_state() {
	let rig = rig().await;
	let active = rig.catalog.seed("r-active", "Closed goal", false);
	let paused = rig.catalog.seed("r-paused", "Open goal", true);

	let closed_id = seed_incentive(&rig.store, "Closed goal", 10).await;
	rig.store.bind_incentive(closed_id, &active).await.unwrap();
	rig.store.set_incentive_closed(closed_id, true).await.unwrap();
	let open_id = seed_incentive(&rig.store, "Open goal", 10).await;
	rig.store.bind_incentive(open_id, &paused).await.unwrap();

	let report = rig.sync.resync().await.unwrap();
	assert_eq!((report.created, report.paused, report.resumed), (0, 1, 1));
	assert!(rig.catalog.reward(&active).unwrap().is_paused);
	assert!(!rig.catalog.reward(&paused).unwrap().is_paused);

	let again = rig.sync.resync().await.unwrap();
	assert_eq!((again.paused, again.resumed), (0, 0));
	assert_eq!(rig.catalog.paused.lock().len(), 2);
}

#[tokio::test]
async fn closed_unit_gets_a_paused_reward() {
	let rig = rig().await;
	let choice_id = seed_choice(&rig.store, "Game", &["Chess"]).await;
	rig.store.set_choice_closed(choice_id, true).await.unwrap();

	rig.sync.resync().await.unwrap();
	let choice = rig.store.choice(choice_id).await.unwrap().unwrap();
	let reward_id = bound(&choice.options[0].reward);
	assert!(rig.catalog.reward(&reward_id).unwrap().is_paused);
}

#[tokio::test]
async fn create_incentive_binds_immediately() {
	let rig = rig().await;
	let incentive = rig.sync.create_incentive("Emotes", "new emotes", None).await.unwrap();

	assert_eq!(incentive.max_votes, 100);
	let reward_id = bound(&incentive.reward);
	assert_eq!(rig.registry.listener_names(&reward_id), vec![INCENTIVE_LISTENER.to_string()]);

	let created = rig.catalog.created.lock()[0].clone();
	assert_eq!(created.title, "Emotes");
	assert_eq!(created.prompt, format!("new emotes - ID: {}", incentive.id));
	assert_eq!(created.cost, 100);
	assert!(created.should_redemptions_skip_request_queue);
	assert!(!created.is_user_input_required);
}

#[tokio::test]
async fn every_created_reward_skips_the_request_queue() {
	let rig = rig().await;
	rig.sync.create_incentive("Emotes", "new emotes", None).await.unwrap();
	let open = rig.sync.create_choice("Name", "name the pet", true).await.unwrap();
	let game = rig.sync.create_choice("Game", "next game", false).await.unwrap();
	rig.sync
		.add_options_to_choice(game.id, &["Chess".to_string()])
		.await
		.unwrap();
	rig.sync.resync().await.unwrap();
	assert!(open.has_open_entry);

	let created = rig.catalog.created.lock().clone();
	let titles: Vec<&str> = created.iter().map(|r| r.title.as_str()).collect();
	assert_eq!(titles, vec!["Emotes", "Name - open Entry!", "Game - Chess"]);
	for reward in &created {
		assert!(reward.should_redemptions_skip_request_queue, "{} queues redemptions", reward.title);
	}
}

#[tokio::test]
async fn create_incentive_without_token_stays_unbound() {
	let rig = tokenless_rig().await;
	let incentive = rig.sync.create_incentive("Emotes", "new emotes", Some(5)).await.unwrap();

	assert!(!incentive.reward.is_bound());
	assert!(rig.catalog.created.lock().is_empty());
}

#[tokio::test]
async fn create_incentive_rejects_bad_input() {
	let rig = rig().await;
	assert!(rig.sync.create_incentive("  ", "x", None).await.is_err());
	assert!(rig.sync.create_incentive("Emotes", "x", Some(0)).await.is_err());
	assert!(rig.store.incentives().await.unwrap().is_empty());
}

#[tokio::test]
async fn long_titles_are_truncated() {
	let rig = rig().await;
	let name = "x".repeat(80);
	rig.sync.create_incentive(&name, "desc", Some(5)).await.unwrap();
	assert_eq!(rig.catalog.created.lock()[0].title.chars().count(), 45);
}

#[tokio::test]
async fn closed_entry_options_materialize_on_resync() {
	let rig = rig().await;
	let choice = rig.sync.create_choice("Game", "next game", false).await.unwrap();
	assert!(rig.catalog.created.lock().is_empty());

	let ids = rig
		.sync
		.add_options_to_choice(choice.id, &["Chess".to_string(), " ".to_string(), "Go".to_string()])
		.await
		.unwrap();
	assert_eq!(ids.len(), 2);
	assert!(rig.catalog.created.lock().is_empty());

	let report = rig.sync.resync().await.unwrap();
	assert_eq!(report.created, 2);

	let choice = rig.sync.choice(choice.id).await.unwrap().unwrap();
	for option in &choice.options {
		let reward_id = bound(&option.reward);
		assert_eq!(rig.registry.listener_names(&reward_id), vec![OPTION_LISTENER.to_string()]);
	}

	let first = rig.catalog.created.lock()[0].clone();
	assert!(first.prompt.starts_with("Vote for \"Chess\" in the Game choice - ID: "));
}

#[tokio::test]
async fn open_entry_choice_requires_input() {
	let rig = rig().await;
	let choice = rig.sync.create_choice("Names", "name the pet", true).await.unwrap();

	let reward_id = bound(&choice.reward);
	assert_eq!(rig.registry.listener_names(&reward_id), vec![OPEN_ENTRY_LISTENER.to_string()]);
	let created = rig.catalog.created.lock()[0].clone();
	assert_eq!(created.title, "Names - open Entry!");
	assert!(created.is_user_input_required);

	let err = rig
		.sync
		.add_options_to_choice(choice.id, &["Rex".to_string()])
		.await
		.expect_err("open entry takes viewer input");
	assert!(err.to_string().contains("viewers"));
}

#[tokio::test]
async fn close_choice_pauses_every_option() {
	let rig = rig().await;
	let choice_id = seed_choice(&rig.store, "Game", &["Chess", "Go"]).await;
	rig.sync.resync().await.unwrap();

	let closed = rig.sync.close_choice(choice_id).await.unwrap();
	assert!(closed.is_closed);
	for option in &closed.options {
		assert!(rig.catalog.reward(&bound(&option.reward)).unwrap().is_paused);
	}

	let report = rig.sync.resync().await.unwrap();
	assert_eq!(report.paused, 0);
}

#[tokio::test]
async fn close_without_token_closes_locally() {
	let rig = tokenless_rig().await;
	let incentive = rig.sync.create_incentive("Emotes", "x", Some(5)).await.unwrap();

	let closed = rig.sync.close_incentive(incentive.id).await.unwrap();
	assert!(closed.is_closed);
	assert!(rig.catalog.paused.lock().is_empty());
}

#[tokio::test]
async fn delete_removes_reward_listeners_and_row() {
	let rig = rig().await;
	let incentive = rig.sync.create_incentive("Emotes", "x", Some(5)).await.unwrap();
	let reward_id = bound(&incentive.reward);

	rig.sync.delete_incentive(incentive.id).await.unwrap();
	assert_eq!(rig.catalog.deleted.lock().clone(), vec![reward_id.clone()]);
	assert!(rig.registry.listener_names(&reward_id).is_empty());
	assert!(rig.sync.incentive(incentive.id).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_tolerates_reward_already_gone() {
	let rig = rig().await;
	let choice = rig.sync.create_choice("Names", "x", true).await.unwrap();
	rig.catalog.forget(&bound(&choice.reward));

	rig.sync.delete_choice(choice.id).await.unwrap();
	assert!(rig.sync.choice(choice.id).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_of_bound_unit_needs_token() {
	let rig = tokenless_rig().await;
	let id = seed_incentive(&rig.store, "Emotes", 5).await;
	rig.store
		.bind_incentive(id, &RewardId::new("r-1").unwrap())
		.await
		.unwrap();

	assert!(rig.sync.delete_incentive(id).await.is_err());
	assert!(rig.store.incentive(id).await.unwrap().is_some());
}

#[tokio::test]
async fn list_rewards_needs_token() {
	let rig = rig().await;
	rig.catalog.seed("r-1", "Existing", false);
	assert_eq!(rig.sync.list_rewards().await.unwrap().len(), 1);

	let tokenless = tokenless_rig().await;
	assert!(tokenless.sync.list_rewards().await.is_err());
}

#[tokio::test]
async fn incentive_votes_announce_progress_and_completion() {
	let rig = rig().await;
	let incentive = rig.sync.create_incentive("Emotes", "x", Some(10)).await.unwrap();
	let reward_id = bound(&incentive.reward);

	for _ in 0..5 {
		let report = rig.registry.dispatch(redemption(&reward_id, None)).await;
		assert_eq!(report, DispatchReport { invoked: 1, failed: 0 });
	}
	assert_eq!(rig.announcer.lines.lock().clone(), vec![
		threshold_message_for("Emotes", 25),
		threshold_message_for("Emotes", 50),
	]);

	for _ in 5..10 {
		rig.registry.dispatch(redemption(&reward_id, None)).await;
	}
	let after = rig.store.incentive(incentive.id).await.unwrap().unwrap();
	assert_eq!(after.current_votes, 10);
	assert!(after.is_closed);
	assert!(rig.catalog.reward(&reward_id).unwrap().is_paused);
	assert_eq!(rig.announcer.lines.lock().clone(), vec![
		threshold_message_for("Emotes", 25),
		threshold_message_for("Emotes", 50),
		threshold_message_for("Emotes", 75),
		"The Emotes incentive has been met!".to_string(),
	]);

	rig.registry.dispatch(redemption(&reward_id, None)).await;
	assert_eq!(rig.announcer.lines.lock().len(), 4);
	assert_eq!(rig.catalog.paused.lock().len(), 1);
}

fn threshold_message_for(name: &str, percent: u32) -> String {
	format!("{name} is {percent}% complete! Use Channel Points to push it forward!")
}

#[tokio::test]
async fn unmatched_vote_changes_nothing() {
	let rig = rig().await;
	let id = seed_incentive(&rig.store, "Emotes", 10).await;
	let handler = IncentiveVotes::new(rig.store.clone(), Arc::clone(&rig.controls), rig.announcer.clone());

	let ghost = RewardId::new("ghost").unwrap();
	handler.on_redemption(&redemption(&ghost, None)).await.unwrap();

	assert_eq!(rig.store.incentive(id).await.unwrap().unwrap().current_votes, 0);
	assert!(rig.announcer.lines.lock().is_empty());
}

#[tokio::test]
async fn option_votes_count_per_reward() {
	let rig = rig().await;
	let choice_id = seed_choice(&rig.store, "Game", &["Chess", "Go"]).await;
	rig.sync.resync().await.unwrap();

	let choice = rig.store.choice(choice_id).await.unwrap().unwrap();
	let chess = bound(&choice.options[0].reward);
	rig.registry.dispatch(redemption(&chess, None)).await;
	rig.registry.dispatch(redemption(&chess, None)).await;

	let choice = rig.store.choice(choice_id).await.unwrap().unwrap();
	let standings: Vec<(String, u32)> = choice.standings().iter().map(|o| (o.name.clone(), o.votes)).collect();
	assert_eq!(standings, vec![("Chess".to_string(), 2), ("Go".to_string(), 0)]);
}

#[tokio::test]
async fn open_entry_inserts_then_increments() {
	let rig = rig().await;
	let choice = rig.sync.create_choice("Names", "x", true).await.unwrap();
	let reward_id = bound(&choice.reward);

	rig.registry.dispatch(redemption(&reward_id, Some("Alice"))).await;
	let after_first = rig.store.choice(choice.id).await.unwrap().unwrap();
	assert_eq!(after_first.options.len(), 1);
	assert_eq!(after_first.options[0].name, "Alice");
	assert_eq!(after_first.options[0].votes, 1);

	rig.registry.dispatch(redemption(&reward_id, Some("Alice"))).await;
	rig.registry.dispatch(redemption(&reward_id, Some("  alice "))).await;
	rig.registry.dispatch(redemption(&reward_id, Some("   "))).await;

	let after = rig.store.choice(choice.id).await.unwrap().unwrap();
	assert_eq!(after.options.len(), 1);
	assert_eq!(after.options[0].votes, 3);
}
