//! Chess position model.
//!
//! A thin adapter around the `chess` crate: immutable positions carrying a
//! cached FEN fingerprint, legality-checked move application, SAN/UCI move
//! parsing (request moves may arrive in either notation), and a SAN printer
//! (the `chess` crate parses SAN but does not format it).
//!
//! Positions are values: cheap to copy, never mutated. Applying a move
//! yields a new position.

use std::fmt;
use std::str::FromStr;

use chess::{Board, BoardStatus, ChessMove, Color, MoveGen, Piece, Square};

use crate::error::Error;

/// Terminal classification of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Ongoing,
    /// The side to move is checkmated.
    Checkmate,
    /// The side to move has no legal moves and is not in check.
    Stalemate,
}

/// An immutable chess position plus its FEN fingerprint.
#[derive(Debug, Clone)]
pub struct Position {
    board: Board,
    fen: String,
}

impl Position {
    /// Parse a FEN string into a position.
    pub fn from_fen(fen: &str) -> Result<Self, Error> {
        let board = Board::from_str(fen.trim())
            .map_err(|e| Error::InvalidInput(format!("bad FEN '{}': {}", fen, e)))?;
        Ok(Self::from_board(board))
    }

    fn from_board(board: Board) -> Self {
        Self {
            fen: format!("{}", board),
            board,
        }
    }

    /// The position's FEN fingerprint.
    pub fn fen(&self) -> &str {
        &self.fen
    }

    pub fn side_to_move(&self) -> Color {
        self.board.side_to_move()
    }

    pub fn legal_move_count(&self) -> usize {
        MoveGen::new_legal(&self.board).len()
    }

    /// All legal moves, in generation order (deterministic for a given
    /// position).
    pub fn legal_moves(&self) -> Vec<ChessMove> {
        MoveGen::new_legal(&self.board).collect()
    }

    pub fn status(&self) -> PositionStatus {
        match self.board.status() {
            BoardStatus::Ongoing => PositionStatus::Ongoing,
            BoardStatus::Checkmate => PositionStatus::Checkmate,
            BoardStatus::Stalemate => PositionStatus::Stalemate,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status() != PositionStatus::Ongoing
    }

    /// Parse a move given in either UCI ("e2e4", "e7e8q") or SAN ("Nf3",
    /// "exd5", "O-O") notation, verifying legality in this position.
    pub fn parse_move(&self, text: &str) -> Result<ChessMove, Error> {
        if let Some(chess_move) = self.parse_uci_move(text) {
            return Ok(chess_move);
        }
        ChessMove::from_san(&self.board, text.trim())
            .map_err(|_| Error::InvalidInput(format!("illegal or unparseable move '{}'", text)))
    }

    /// Parse a UCI move string into a legal move, or None.
    fn parse_uci_move(&self, move_str: &str) -> Option<ChessMove> {
        let move_str = move_str.trim();
        if move_str.len() < 4 || move_str.len() > 5 {
            return None;
        }

        let from = Square::from_str(&move_str[0..2]).ok()?;
        let to = Square::from_str(&move_str[2..4]).ok()?;

        let promotion = if move_str.len() > 4 {
            match move_str.as_bytes()[4] {
                b'q' | b'Q' => Some(Piece::Queen),
                b'r' | b'R' => Some(Piece::Rook),
                b'b' | b'B' => Some(Piece::Bishop),
                b'n' | b'N' => Some(Piece::Knight),
                _ => return None,
            }
        } else {
            None
        };

        let chess_move = ChessMove::new(from, to, promotion);
        if self.board.legal(chess_move) {
            Some(chess_move)
        } else {
            None
        }
    }

    /// Apply a legal move, producing the resulting position.
    pub fn apply(&self, chess_move: ChessMove) -> Position {
        Self::from_board(self.board.make_move_new(chess_move))
    }

    /// Parse and apply a UCI move string.
    pub fn apply_uci(&self, move_str: &str) -> Result<Position, Error> {
        let chess_move = self
            .parse_uci_move(move_str)
            .ok_or_else(|| Error::InvalidInput(format!("illegal UCI move '{}'", move_str)))?;
        Ok(self.apply(chess_move))
    }

    /// Format a move as a UCI string (e.g., "e2e4", "e7e8q").
    pub fn uci_of(&self, m: ChessMove) -> String {
        let promo = m
            .get_promotion()
            .map(|p| match p {
                Piece::Queen => "q",
                Piece::Rook => "r",
                Piece::Bishop => "b",
                Piece::Knight => "n",
                _ => "",
            })
            .unwrap_or("");
        format!("{}{}{}", m.get_source(), m.get_dest(), promo)
    }

    /// Format a legal move as SAN, with disambiguation and check/mate
    /// suffixes.
    pub fn san_of(&self, m: ChessMove) -> String {
        // Empty source square means the move does not belong to this
        // position; fall back to the UCI string rather than panic.
        let piece = match self.board.piece_on(m.get_source()) {
            Some(piece) => piece,
            None => return self.uci_of(m),
        };

        let mut san = if piece == Piece::King && is_castle(m) {
            if m.get_dest().get_file().to_index() > m.get_source().get_file().to_index() {
                "O-O".to_string()
            } else {
                "O-O-O".to_string()
            }
        } else if piece == Piece::Pawn {
            self.pawn_san(m)
        } else {
            self.piece_san(m, piece)
        };

        let after = self.board.make_move_new(m);
        if after.checkers().popcnt() > 0 {
            san.push(if after.status() == BoardStatus::Checkmate {
                '#'
            } else {
                '+'
            });
        }
        san
    }

    fn pawn_san(&self, m: ChessMove) -> String {
        let mut san = String::new();
        if self.is_capture(m) {
            san.push(file_char(m.get_source()));
            san.push('x');
        }
        san.push_str(&format!("{}", m.get_dest()));
        if let Some(promo) = m.get_promotion() {
            san.push('=');
            san.push(piece_letter(promo));
        }
        san
    }

    fn piece_san(&self, m: ChessMove, piece: Piece) -> String {
        let mut san = String::new();
        san.push(piece_letter(piece));
        san.push_str(&self.disambiguation(m, piece));
        if self.is_capture(m) {
            san.push('x');
        }
        san.push_str(&format!("{}", m.get_dest()));
        san
    }

    /// Minimal origin qualifier: file, then rank, then full square.
    fn disambiguation(&self, m: ChessMove, piece: Piece) -> String {
        let rivals: Vec<Square> = MoveGen::new_legal(&self.board)
            .filter(|other| {
                other.get_dest() == m.get_dest()
                    && other.get_source() != m.get_source()
                    && self.board.piece_on(other.get_source()) == Some(piece)
            })
            .map(|other| other.get_source())
            .collect();

        if rivals.is_empty() {
            return String::new();
        }
        let source = m.get_source();
        if rivals.iter().all(|s| s.get_file() != source.get_file()) {
            return file_char(source).to_string();
        }
        if rivals.iter().all(|s| s.get_rank() != source.get_rank()) {
            return rank_char(source).to_string();
        }
        format!("{}", source)
    }

    fn is_capture(&self, m: ChessMove) -> bool {
        if self.board.piece_on(m.get_dest()).is_some() {
            return true;
        }
        // En passant: a pawn moving diagonally onto an empty square.
        self.board.piece_on(m.get_source()) == Some(Piece::Pawn)
            && m.get_source().get_file() != m.get_dest().get_file()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fen)
    }
}

fn is_castle(m: ChessMove) -> bool {
    let from = m.get_source().get_file().to_index() as i32;
    let to = m.get_dest().get_file().to_index() as i32;
    (from - to).abs() == 2
}

fn piece_letter(piece: Piece) -> char {
    match piece {
        Piece::Knight => 'N',
        Piece::Bishop => 'B',
        Piece::Rook => 'R',
        Piece::Queen => 'Q',
        Piece::King => 'K',
        Piece::Pawn => 'P',
    }
}

fn file_char(square: Square) -> char {
    (b'a' + square.get_file().to_index() as u8) as char
}

fn rank_char(square: Square) -> char {
    (b'1' + square.get_rank().to_index() as u8) as char
}
