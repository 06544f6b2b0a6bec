//! Turn State Machine
//!
//! Pure transitions over a [`RoomState`]. Each function validates the
//! request against the current phase, mutates the state in place and returns
//! the events describing what happened. Nothing here touches the store, the
//! clock or the network; the engine runs these inside one atomic update.
//!
//! On error the state must be discarded by the caller. The store does this
//! for free because mutators run on a copy.

use chrono::{DateTime, Utc};

use crate::error::GameError;
use crate::game::events::{DrawSource, GameEvent};
use crate::game::rules::{RuleSet, PLAYERS_PER_ROOM};
use crate::game::state::{
    GamePhase, NoWinnerReason, PlayerId, PlayerState, RoomState, RoundOutcome, Seat, TurnPhase,
    TurnState,
};
use crate::game::tile::{TileId, TOTAL_TILES};
use crate::proof::commitment::{validate_client_seed, ServerSeed};
use crate::proof::shuffle::seal_round;

/// Longest accepted display name.
pub const MAX_NAME_LEN: usize = 32;

/// Result of a turn timeout check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// The room left `Playing` or the turn already moved on.
    Stale,
    /// The deadline has not passed yet.
    NotDue,
    /// The turn was completed by auto-play.
    AutoPlayed { turn_number: u32 },
}

// =============================================================================
// SEATING
// =============================================================================

/// Seat a player in the first free seat.
///
/// Re-seating a player who is already at the table is a no-op. The fourth
/// player moves the room to `ReadyToStart`.
pub fn seat_player(
    state: &mut RoomState,
    player: PlayerId,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Vec<GameEvent>, GameError> {
    if state.players.contains_key(&player) {
        return Ok(Vec::new());
    }
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(GameError::Validation(format!(
            "display name must be 1-{} characters",
            MAX_NAME_LEN
        )));
    }
    if state.phase != GamePhase::WaitingForPlayers {
        return Err(GameError::IllegalAction(format!(
            "room {} is not accepting players ({:?})",
            state.id, state.phase
        )));
    }
    let seat = state.free_seat()
        .ok_or_else(|| GameError::IllegalAction(format!("room {} is full", state.id)))?;

    state.players.insert(player, PlayerState::new(player, name, seat, now));
    let mut events = vec![GameEvent::PlayerSeated { player, seat, name: name.to_string() }];

    if state.players.len() == PLAYERS_PER_ROOM {
        let from = state.transition_to(GamePhase::ReadyToStart)?;
        events.push(GameEvent::PhaseChanged { from, to: GamePhase::ReadyToStart });
    }
    Ok(events)
}

/// Remove a player before the game starts.
///
/// A room left with nobody in it is cancelled as abandoned.
pub fn remove_player(
    state: &mut RoomState,
    player: PlayerId,
) -> Result<Vec<GameEvent>, GameError> {
    let seat = state.require_player(&player)?.seat;
    if state.phase != GamePhase::WaitingForPlayers {
        return Err(GameError::IllegalAction(format!(
            "players cannot leave room {} in {:?}",
            state.id, state.phase
        )));
    }
    state.players.remove(&player);
    state.fairness.client_seeds.remove(&seat);

    let mut events = vec![GameEvent::PlayerLeft { player, seat }];
    if state.players.is_empty() {
        events.extend(cancel(state, NoWinnerReason::Abandoned)?);
    }
    Ok(events)
}

/// Record a player's client seed contribution for the upcoming shuffle.
pub fn submit_client_seed(
    state: &mut RoomState,
    player: PlayerId,
    seed: &str,
    now: DateTime<Utc>,
) -> Result<Vec<GameEvent>, GameError> {
    validate_client_seed(seed).map_err(GameError::Validation)?;
    let seat = state.require_player(&player)?.seat;
    if state.phase.is_game_started() || state.fairness.is_sealed() {
        return Err(GameError::IllegalAction("the shuffle is already committed".into()));
    }
    if state.fairness.client_seeds.contains_key(&seat) {
        return Err(GameError::IllegalAction(format!("{} already contributed a seed", seat)));
    }
    state.fairness.client_seeds.insert(seat, seed.to_string());
    if let Some(p) = state.player_mut(&player) {
        p.last_activity_at = now;
    }
    Ok(vec![GameEvent::ClientSeedAccepted { player, seat }])
}

// =============================================================================
// START
// =============================================================================

/// Shuffle, commit, deal and begin the first turn.
///
/// Requires `ReadyToStart` with four connected players. Runs
/// `Shuffling -> Dealing -> Playing` in one step so no other instance ever
/// observes a half-dealt table.
pub fn start_game(
    state: &mut RoomState,
    rules: &RuleSet,
    seed: &ServerSeed,
    now: DateTime<Utc>,
) -> Result<Vec<GameEvent>, GameError> {
    if state.phase != GamePhase::ReadyToStart {
        return Err(GameError::IllegalAction(format!(
            "room {} cannot start from {:?}",
            state.id, state.phase
        )));
    }
    if state.players.len() != PLAYERS_PER_ROOM || state.connected_count() != PLAYERS_PER_ROOM {
        return Err(GameError::IllegalAction(format!(
            "{} of {} players connected",
            state.connected_count(),
            PLAYERS_PER_ROOM
        )));
    }
    let dealt = rules.hand_size * PLAYERS_PER_ROOM + 1;
    if rules.hand_size == 0 || dealt > TOTAL_TILES {
        return Err(GameError::Validation(format!("hand size {} cannot be dealt", rules.hand_size)));
    }

    let mut events = Vec::new();

    let from = state.transition_to(GamePhase::Shuffling)?;
    events.push(GameEvent::PhaseChanged { from, to: GamePhase::Shuffling });

    let round = seal_round(
        seed.clone(),
        state.fairness.next_nonce(),
        state.fairness.combined_client_seed(),
    )
    .map_err(|e| GameError::Internal(e.to_string()))?;
    state.fairness.seal(&round).map_err(|e| GameError::Internal(e.to_string()))?;
    events.push(GameEvent::CommitmentPublished {
        commitment_hash: round.commitment.to_hex(),
        nonce: round.nonce,
    });

    let from = state.transition_to(GamePhase::Dealing)?;
    events.push(GameEvent::PhaseChanged { from, to: GamePhase::Dealing });

    let shuffled = round.shuffled;
    for seat in Seat::ALL {
        let start = seat.index() * rules.hand_size;
        let hand = shuffled[start..start + rules.hand_size].to_vec();
        let player = state.players.values_mut()
            .find(|p| p.seat == seat)
            .ok_or_else(|| GameError::Internal(format!("no player in seat {}", seat)))?;
        player.hand = hand;
    }
    let indicator = shuffled[dealt - 1];
    state.tiles.indicator = Some(indicator);
    // Top of the pile is the last element, so the tile right after the
    // indicator is drawn first.
    state.tiles.draw_pile = shuffled[dealt..].iter().rev().copied().collect();
    state.tiles.discard_pile.clear();
    state.tiles.dealt_order = shuffled;
    events.push(GameEvent::TilesDealt {
        indicator,
        draw_pile_size: state.tiles.draw_pile.len(),
    });

    let from = state.transition_to(GamePhase::Playing)?;
    events.push(GameEvent::PhaseChanged { from, to: GamePhase::Playing });

    begin_turn(state, rules, Seat::East, 1, now, &mut events)?;
    Ok(events)
}

// =============================================================================
// TURN ACTIONS
// =============================================================================

/// Draw the top tile of the draw pile.
///
/// An empty draw pile ends the round without a winner.
pub fn draw(
    state: &mut RoomState,
    player: PlayerId,
    now: DateTime<Utc>,
) -> Result<Vec<GameEvent>, GameError> {
    expect_turn(state, player, TurnPhase::WaitingForDraw)?;
    let mut events = Vec::new();

    let Some(tile) = state.tiles.draw_pile.pop() else {
        finish(state, RoundOutcome::NoWinner { reason: NoWinnerReason::DrawPileExhausted }, &mut events)?;
        return Ok(events);
    };
    take_into_hand(state, player, tile, now)?;
    events.push(GameEvent::TileDrawn {
        player,
        source: DrawSource::DrawPile,
        tile: None,
        draw_pile_remaining: state.tiles.draw_pile.len(),
    });
    Ok(events)
}

/// Take the top of the discard pile instead of drawing.
pub fn pickup_discard(
    state: &mut RoomState,
    rules: &RuleSet,
    player: PlayerId,
    now: DateTime<Utc>,
) -> Result<Vec<GameEvent>, GameError> {
    if !rules.allow_discard_pickup {
        return Err(GameError::IllegalAction("discard pickup is disabled".into()));
    }
    expect_turn(state, player, TurnPhase::WaitingForDraw)?;
    let tile = state.tiles.discard_pile.pop()
        .ok_or_else(|| GameError::IllegalAction("discard pile is empty".into()))?;
    take_into_hand(state, player, tile, now)?;
    Ok(vec![GameEvent::TileDrawn {
        player,
        source: DrawSource::DiscardPile,
        tile: Some(tile),
        draw_pile_remaining: state.tiles.draw_pile.len(),
    }])
}

/// Discard a tile and pass the turn to the next seat.
pub fn discard(
    state: &mut RoomState,
    rules: &RuleSet,
    player: PlayerId,
    tile: TileId,
    now: DateTime<Utc>,
) -> Result<Vec<GameEvent>, GameError> {
    if TileId::new(tile.0).is_none() {
        return Err(GameError::Validation(format!("tile id {} out of range", tile.0)));
    }
    let turn = expect_turn(state, player, TurnPhase::WaitingForDiscard)?;
    let turn_number = turn.number;
    let position = turn.position;

    let p = state.player_mut(&player).ok_or_else(|| GameError::player_not_found(player))?;
    if !p.take_tile(tile) {
        return Err(GameError::IllegalAction(format!("{} is not in hand", tile)));
    }
    p.last_activity_at = now;
    state.tiles.discard_pile.push(tile);

    let mut events = vec![GameEvent::TileDiscarded { player, tile }];
    complete_turn(state, rules, position, turn_number, now, &mut events)?;
    Ok(events)
}

/// Auto-play an expired turn.
///
/// `expected_turn` is the turn number the caller observed. Anything other than
/// a still-running, overdue turn with that number is left untouched.
pub fn on_turn_timeout(
    state: &mut RoomState,
    rules: &RuleSet,
    expected_turn: u32,
    now: DateTime<Utc>,
) -> Result<(TimeoutOutcome, Vec<GameEvent>), GameError> {
    let turn = match (&state.phase, &state.turn) {
        (GamePhase::Playing, Some(turn)) if turn.number == expected_turn => turn.clone(),
        _ => return Ok((TimeoutOutcome::Stale, Vec::new())),
    };
    if !turn.is_expired(now) {
        return Ok((TimeoutOutcome::NotDue, Vec::new()));
    }

    let mut events = Vec::new();
    let outcome = TimeoutOutcome::AutoPlayed { turn_number: turn.number };
    if let Some(t) = state.turn.as_mut() {
        t.auto_play = true;
    }

    let mut drew = false;
    if !turn.has_drawn {
        let Some(tile) = state.tiles.draw_pile.pop() else {
            events.push(GameEvent::AutoPlayed {
                player: turn.player,
                turn_number: turn.number,
                drew: false,
                discarded: None,
            });
            finish(state, RoundOutcome::NoWinner { reason: NoWinnerReason::DrawPileExhausted }, &mut events)?;
            return Ok((outcome, events));
        };
        take_into_hand(state, turn.player, tile, now)?;
        drew = true;
    }

    let last_drawn = state.turn.as_ref().and_then(|t| t.last_drawn);
    let indicator = state.tiles.indicator;
    let hand = &state.require_player(&turn.player)?.hand;
    let Some(tile) = rules.select_auto_discard(hand, last_drawn, indicator) else {
        events.push(GameEvent::AutoPlayed {
            player: turn.player,
            turn_number: turn.number,
            drew,
            discarded: None,
        });
        finish(state, RoundOutcome::NoWinner { reason: NoWinnerReason::NoLegalDiscard }, &mut events)?;
        return Ok((outcome, events));
    };

    if let Some(p) = state.player_mut(&turn.player) {
        p.take_tile(tile);
    }
    state.tiles.discard_pile.push(tile);
    events.push(GameEvent::AutoPlayed {
        player: turn.player,
        turn_number: turn.number,
        drew,
        discarded: Some(tile),
    });
    complete_turn(state, rules, turn.position, turn.number, now, &mut events)?;
    Ok((outcome, events))
}

// =============================================================================
// END OF ROUND
// =============================================================================

/// Finish a round in play with the given outcome and reveal the shuffle.
pub fn end_game(
    state: &mut RoomState,
    outcome: RoundOutcome,
) -> Result<Vec<GameEvent>, GameError> {
    if state.phase != GamePhase::Playing {
        return Err(GameError::IllegalAction(format!(
            "room {} is not in play ({:?})",
            state.id, state.phase
        )));
    }
    if let RoundOutcome::Won { winner } = outcome {
        state.require_player(&winner)?;
    }
    let mut events = Vec::new();
    finish(state, outcome, &mut events)?;
    Ok(events)
}

/// Cancel a room from any non-terminal phase.
///
/// A published commitment is revealed so the aborted deal can still be
/// audited.
pub fn cancel(
    state: &mut RoomState,
    reason: NoWinnerReason,
) -> Result<Vec<GameEvent>, GameError> {
    let from = state.transition_to(GamePhase::Cancelled)?;
    let outcome = RoundOutcome::NoWinner { reason };
    state.turn = None;
    state.outcome = Some(outcome);
    state.sync_turn_flags();

    let mut events = vec![
        GameEvent::PhaseChanged { from, to: GamePhase::Cancelled },
        GameEvent::RoundEnded { outcome },
    ];
    reveal(state, &mut events);
    Ok(events)
}

// =============================================================================
// CONNECTION STATUS
// =============================================================================

/// Record that a player's connection dropped. Hand and turn are untouched.
pub fn mark_disconnected(
    state: &mut RoomState,
    player: PlayerId,
    now: DateTime<Utc>,
) -> Result<Vec<GameEvent>, GameError> {
    let p = state.player_mut(&player).ok_or_else(|| GameError::player_not_found(player))?;
    if !p.connected {
        return Ok(Vec::new());
    }
    p.connected = false;
    p.disconnected_at = Some(now);
    Ok(vec![GameEvent::PlayerConnection { player, connected: false }])
}

/// Record that a player is connected again.
pub fn mark_connected(
    state: &mut RoomState,
    player: PlayerId,
    now: DateTime<Utc>,
) -> Result<Vec<GameEvent>, GameError> {
    let p = state.player_mut(&player).ok_or_else(|| GameError::player_not_found(player))?;
    let was_connected = p.connected;
    p.connected = true;
    p.last_connected_at = Some(now);
    p.last_activity_at = now;
    if was_connected {
        return Ok(Vec::new());
    }
    Ok(vec![GameEvent::PlayerConnection { player, connected: true }])
}

// =============================================================================
// HELPERS
// =============================================================================

fn expect_turn(
    state: &RoomState,
    player: PlayerId,
    phase: TurnPhase,
) -> Result<&TurnState, GameError> {
    state.require_player(&player)?;
    if state.phase != GamePhase::Playing {
        return Err(GameError::IllegalAction(format!("room {} is not in play", state.id)));
    }
    let turn = state.turn.as_ref()
        .ok_or_else(|| GameError::Internal(format!("room {} is playing without a turn", state.id)))?;
    if turn.player != player {
        return Err(GameError::IllegalAction("not your turn".into()));
    }
    if turn.phase != phase {
        let msg = match turn.phase {
            TurnPhase::WaitingForDraw => "draw a tile before discarding",
            TurnPhase::WaitingForDiscard => "already drew this turn",
            TurnPhase::TurnCompleted => "turn is already complete",
        };
        return Err(GameError::IllegalAction(msg.into()));
    }
    Ok(turn)
}

fn take_into_hand(
    state: &mut RoomState,
    player: PlayerId,
    tile: TileId,
    now: DateTime<Utc>,
) -> Result<(), GameError> {
    let p = state.player_mut(&player).ok_or_else(|| GameError::player_not_found(player))?;
    p.hand.push(tile);
    p.last_activity_at = now;
    if let Some(turn) = state.turn.as_mut() {
        turn.has_drawn = true;
        turn.last_drawn = Some(tile);
        turn.phase = TurnPhase::WaitingForDiscard;
    }
    state.sync_turn_flags();
    Ok(())
}

fn complete_turn(
    state: &mut RoomState,
    rules: &RuleSet,
    position: Seat,
    turn_number: u32,
    now: DateTime<Utc>,
    events: &mut Vec<GameEvent>,
) -> Result<(), GameError> {
    if let Some(turn) = state.turn.as_mut() {
        turn.phase = TurnPhase::TurnCompleted;
    }
    if state.tiles.draw_pile.is_empty() {
        return finish(state, RoundOutcome::NoWinner { reason: NoWinnerReason::DrawPileExhausted }, events);
    }
    begin_turn(state, rules, position.next(), turn_number + 1, now, events)
}

fn begin_turn(
    state: &mut RoomState,
    rules: &RuleSet,
    seat: Seat,
    number: u32,
    now: DateTime<Utc>,
    events: &mut Vec<GameEvent>,
) -> Result<(), GameError> {
    let player = state.player_at(seat)
        .map(|p| p.id)
        .ok_or_else(|| GameError::Internal(format!("no player in seat {}", seat)))?;
    let turn = TurnState::begin(seat, player, number, now, rules.turn_duration());
    events.push(GameEvent::TurnStarted {
        player,
        seat,
        turn_number: number,
        expires_at: turn.expires_at,
    });
    state.turn = Some(turn);
    state.sync_turn_flags();
    Ok(())
}

fn finish(
    state: &mut RoomState,
    outcome: RoundOutcome,
    events: &mut Vec<GameEvent>,
) -> Result<(), GameError> {
    let from = state.transition_to(GamePhase::Finished)?;
    state.turn = None;
    state.outcome = Some(outcome);
    state.sync_turn_flags();
    events.push(GameEvent::PhaseChanged { from, to: GamePhase::Finished });
    events.push(GameEvent::RoundEnded { outcome });
    reveal(state, events);
    Ok(())
}

fn reveal(state: &mut RoomState, events: &mut Vec<GameEvent>) {
    if let Some(disclosure) = state.fairness.reveal(&state.tiles.dealt_order) {
        events.push(GameEvent::SeedRevealed {
            commitment_hash: disclosure.commitment_hash,
            nonce: disclosure.nonce,
        });
    }
}
