use rookery::{
  config::MatchSettings,
  coordinator::MatchCoordinator,
  protocol::{ClientMessage, MatchResult, MatchStatus, MoveRequest, ServerMessage},
  registry::{Connection, ConnectionRegistry},
  rules::ChessRules,
  store::{InMemoryStore, MatchStore},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

type Inbox = mpsc::UnboundedReceiver<String>;

const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

fn coordinator(store: Arc<InMemoryStore>) -> MatchCoordinator<ChessRules> {
  MatchCoordinator::new(
    ChessRules,
    store,
    ConnectionRegistry::new(),
    MatchSettings::default(),
  )
}

async fn connect(c: &MatchCoordinator<ChessRules>, who: &str) -> Inbox {
  let (tx, rx) = mpsc::unbounded_channel();
  c.connect(Connection::new(who, tx)).await;
  rx
}

fn drain(rx: &mut Inbox) -> Vec<ServerMessage> {
  let mut out = Vec::new();
  while let Ok(text) = rx.try_recv() {
    out.push(serde_json::from_str(&text).unwrap());
  }
  out
}

fn play(game_id: &str, from: &str, to: &str) -> ClientMessage {
  ClientMessage::Move {
    game_id: game_id.to_string(),
    mv: MoveRequest {
      from: from.to_string(),
      to: to.to_string(),
      promotion: None,
    },
  }
}

/// Pair alice (white) with bob (black) and return the match id.
async fn pair(c: &MatchCoordinator<ChessRules>, alice: &mut Inbox, bob: &mut Inbox) -> String {
  c.handle("alice", ClientMessage::InitGame).await;
  let game_id = match &drain(alice)[..] {
    [ServerMessage::GameAdded { game_id }] => game_id.clone(),
    other => panic!("expected GAME_ADDED, got {:?}", other),
  };

  c.handle("bob", ClientMessage::InitGame).await;
  for inbox in [alice, bob] {
    match &drain(inbox)[..] {
      [ServerMessage::InitGame { game_id: id, white_player, black_player, fen, moves }] => {
        assert_eq!(id, &game_id);
        assert_eq!(white_player.id, "alice");
        assert_eq!(black_player.id, "bob");
        assert_eq!(fen, START_FEN);
        assert!(moves.is_empty());
      }
      other => panic!("expected INIT_GAME, got {:?}", other),
    }
  }
  game_id
}

#[tokio::test(start_paused = true)]
async fn pair_play_and_exit_settles_ratings() {
  let store = Arc::new(InMemoryStore::default());
  let c = coordinator(store.clone());
  let mut alice = connect(&c, "alice").await;
  let mut bob = connect(&c, "bob").await;
  let game_id = pair(&c, &mut alice, &mut bob).await;

  let script = [
    ("alice", "e2", "e4", 2, (2_000, 0)),
    ("bob", "e7", "e5", 3, (2_000, 3_000)),
    ("alice", "g1", "f3", 4, (6_000, 3_000)),
  ];
  for (who, from, to, think, expected) in script {
    tokio::time::advance(Duration::from_secs(think)).await;
    c.handle(who, play(&game_id, from, to)).await;

    for inbox in [&mut alice, &mut bob] {
      match &drain(inbox)[..] {
        [ServerMessage::Move { mv, player1_time_consumed, player2_time_consumed }] => {
          assert_eq!((mv.from.as_str(), mv.to.as_str()), (from, to));
          assert_eq!((*player1_time_consumed, *player2_time_consumed), expected);
        }
        other => panic!("expected MOVE, got {:?}", other),
      }
    }
  }

  c.handle("bob", ClientMessage::ExitGame { game_id: game_id.clone() }).await;

  let msgs = drain(&mut alice);
  match &msgs[..] {
    [ServerMessage::GameEnded { status, result, moves, rating_changes, .. }, ServerMessage::RatingUpdate { new_rating, rating_change, .. }, ServerMessage::LeaderboardUpdate { game_completed: true, .. }] =>
    {
      assert_eq!(*status, MatchStatus::PlayerExit);
      assert_eq!(*result, MatchResult::WhiteWins);
      assert_eq!(moves.len(), 3);
      let changes = rating_changes.expect("ratings were settled");
      assert_eq!(changes.white_rating_change, 16);
      assert_eq!(changes.black_rating_change, -16);
      assert_eq!((*new_rating, *rating_change), (1216, 16));
    }
    other => panic!("unexpected {:?}", other),
  }

  let white = store.read_rating("alice").await.unwrap().unwrap();
  let black = store.read_rating("bob").await.unwrap().unwrap();
  assert_eq!((white.current_rating, white.wins, white.win_streak), (1216, 1, 1));
  assert_eq!((black.current_rating, black.losses, black.win_streak), (1184, 1, 0));

  let stored = store.read_match(&game_id).await.unwrap().unwrap();
  assert_eq!(stored.status, MatchStatus::PlayerExit);
  assert_eq!(stored.result, Some(MatchResult::WhiteWins));
  assert!(c.session(&game_id).await.is_none());
}

#[tokio::test]
async fn illegal_and_off_turn_moves_change_nothing() {
  let c = coordinator(Arc::new(InMemoryStore::default()));
  let mut alice = connect(&c, "alice").await;
  let mut bob = connect(&c, "bob").await;
  let game_id = pair(&c, &mut alice, &mut bob).await;

  c.handle("bob", play(&game_id, "e7", "e5")).await;
  c.handle("alice", play(&game_id, "e2", "e5")).await;
  c.handle("alice", play(&game_id, "z9", "e4")).await;

  assert!(drain(&mut alice).is_empty());
  assert!(drain(&mut bob).is_empty());
  let view = c.session(&game_id).await.unwrap().view().await;
  assert_eq!(view.position, START_FEN);
  assert!(view.moves.is_empty());
}

#[tokio::test]
async fn checkmate_completes_the_match() {
  let store = Arc::new(InMemoryStore::default());
  let c = coordinator(store.clone());
  let mut alice = connect(&c, "alice").await;
  let mut bob = connect(&c, "bob").await;
  let game_id = pair(&c, &mut alice, &mut bob).await;

  for (who, from, to) in [
    ("alice", "f2", "f3"),
    ("bob", "e7", "e5"),
    ("alice", "g2", "g4"),
    ("bob", "d8", "h4"),
  ] {
    c.handle(who, play(&game_id, from, to)).await;
  }

  let ended = drain(&mut bob)
    .into_iter()
    .find(|m| matches!(m, ServerMessage::GameEnded { .. }));
  assert!(matches!(
    ended,
    Some(ServerMessage::GameEnded { status: MatchStatus::Completed, result: MatchResult::BlackWins, .. })
  ));
  assert!(c.session(&game_id).await.is_none());
  assert_eq!(
    store.read_match(&game_id).await.unwrap().unwrap().status,
    MatchStatus::Completed
  );
}

#[tokio::test]
async fn repeating_the_position_three_times_is_a_draw() {
  let store = Arc::new(InMemoryStore::default());
  let c = coordinator(store.clone());
  let mut alice = connect(&c, "alice").await;
  let mut bob = connect(&c, "bob").await;
  let game_id = pair(&c, &mut alice, &mut bob).await;

  for _ in 0..2 {
    for (who, from, to) in [
      ("alice", "g1", "f3"),
      ("bob", "g8", "f6"),
      ("alice", "f3", "g1"),
      ("bob", "f6", "g8"),
    ] {
      c.handle(who, play(&game_id, from, to)).await;
    }
  }

  let ended = drain(&mut alice)
    .into_iter()
    .find(|m| matches!(m, ServerMessage::GameEnded { .. }));
  assert!(matches!(
    ended,
    Some(ServerMessage::GameEnded { status: MatchStatus::Completed, result: MatchResult::Draw, .. })
  ));
  assert!(c.session(&game_id).await.is_none());
  assert_eq!(
    store.read_match(&game_id).await.unwrap().unwrap().status,
    MatchStatus::Completed
  );
}

#[tokio::test]
async fn chat_reaches_everyone_including_the_sender() {
  let c = coordinator(Arc::new(InMemoryStore::default()));
  let mut alice = connect(&c, "alice").await;
  let mut bob = connect(&c, "bob").await;
  let game_id = pair(&c, &mut alice, &mut bob).await;

  c.handle(
    "bob",
    ClientMessage::ChatSend {
      game_id: game_id.clone(),
      text: "have fun".into(),
    },
  )
  .await;

  for inbox in [&mut alice, &mut bob] {
    match &drain(inbox)[..] {
      [ServerMessage::ChatMessage { text, from_user_id, ts, .. }] => {
        assert_eq!(text, "have fun");
        assert_eq!(from_user_id, "bob");
        assert!(*ts > 0);
      }
      other => panic!("expected CHAT_MESSAGE, got {:?}", other),
    }
  }
}

#[tokio::test(start_paused = true)]
async fn rejoining_after_restart_rebuilds_the_same_game() {
  let store = Arc::new(InMemoryStore::default());
  let first = coordinator(store.clone());
  let mut alice = connect(&first, "alice").await;
  let mut bob = connect(&first, "bob").await;
  let game_id = pair(&first, &mut alice, &mut bob).await;

  for (who, from, to, think) in [
    ("alice", "d2", "d4", 5),
    ("bob", "g8", "f6", 7),
    ("alice", "c2", "c4", 1),
    ("bob", "e7", "e6", 2),
  ] {
    tokio::time::advance(Duration::from_secs(think)).await;
    first.handle(who, play(&game_id, from, to)).await;
  }
  let live = first.session(&game_id).await.unwrap().view().await;

  let second = coordinator(store);
  let mut returning = connect(&second, "alice").await;
  second
    .handle("alice", ClientMessage::JoinRoom { game_id: game_id.clone() })
    .await;

  match &drain(&mut returning)[..] {
    [ServerMessage::GameJoined { moves, white_player, black_player, player1_time_consumed, player2_time_consumed, .. }] =>
    {
      assert_eq!(moves, &live.moves);
      assert_eq!(white_player.id, "alice");
      assert_eq!(black_player.id, "bob");
      // White is on move, so only white's clock includes running time.
      assert!(*player1_time_consumed >= 6_000);
      assert_eq!(*player2_time_consumed, 9_000);
    }
    other => panic!("expected GAME_JOINED, got {:?}", other),
  }

  let rebuilt = second.session(&game_id).await.unwrap().view().await;
  assert_eq!(rebuilt.position, live.position);
  assert_eq!(rebuilt.white_time_consumed, live.white_time_consumed);
  assert_eq!(rebuilt.black_time_consumed, live.black_time_consumed);

  second.handle("alice", play(&game_id, "b1", "c3")).await;
  assert!(matches!(&drain(&mut returning)[..], [ServerMessage::Move { .. }]));
}

#[tokio::test(start_paused = true)]
async fn silent_side_on_move_loses_by_abandonment() {
  let store = Arc::new(InMemoryStore::default());
  let c = coordinator(store.clone());
  let mut alice = connect(&c, "alice").await;
  let mut bob = connect(&c, "bob").await;
  let game_id = pair(&c, &mut alice, &mut bob).await;

  c.handle("alice", play(&game_id, "e2", "e4")).await;
  drain(&mut alice);

  tokio::time::sleep(Duration::from_secs(61)).await;
  let ended = loop {
    let text = alice.recv().await.expect("connection still open");
    let msg: ServerMessage = serde_json::from_str(&text).unwrap();
    if matches!(msg, ServerMessage::GameEnded { .. }) {
      break msg;
    }
  };
  assert!(matches!(
    ended,
    ServerMessage::GameEnded { status: MatchStatus::Abandoned, result: MatchResult::WhiteWins, .. }
  ));

  tokio::task::yield_now().await;
  assert!(c.session(&game_id).await.is_none());
  let stored = store.read_match(&game_id).await.unwrap().unwrap();
  assert_eq!(stored.status, MatchStatus::Abandoned);
}

#[tokio::test]
async fn unknown_room_is_reported() {
  let c = coordinator(Arc::new(InMemoryStore::default()));
  let mut carol = connect(&c, "carol").await;
  c.handle("carol", ClientMessage::JoinRoom { game_id: "nope".into() }).await;
  assert_eq!(drain(&mut carol), vec![ServerMessage::GameNotFound]);
}
