use iced::{
    alignment::Horizontal,
    theme,
    widget::{button, column, container, row, scrollable, text, text_input, Button},
    Alignment, Application, Background, Color, Command, Element, Length, Settings, Subscription,
    Theme,
};

use chrono::{DateTime, Local, Utc};
use dotenv::dotenv;
use std::any::TypeId;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

use ivychat::api::ApiClient;
use ivychat::cable::CableConnection;
use ivychat::config::Config;
use ivychat::models::{Chat, ChatHistory, Sender, User, WireMessage};
use ivychat::normalize::{history_message, normalize, Inbound, NormalizeContext};
use ivychat::session::Session;
use ivychat::store::MessageStore;
use ivychat::subscription::{ChatEvent, ChatSubscription, RedialGate, RedialStep};

/// Carrier for a non-cloneable payload routed through the message enum;
/// the receiving update arm takes the value out exactly once.
#[derive(Debug)]
struct Handoff<T>(Arc<std::sync::Mutex<Option<T>>>);

impl<T> Handoff<T> {
    fn new(value: T) -> Self {
        Handoff(Arc::new(std::sync::Mutex::new(Some(value))))
    }

    fn take(&self) -> Option<T> {
        match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl<T> Clone for Handoff<T> {
    fn clone(&self) -> Self {
        Handoff(Arc::clone(&self.0))
    }
}

type OpenedChannel = Handoff<(ChatSubscription, mpsc::UnboundedReceiver<ChatEvent>)>;

/// The conversation currently on screen, with its own store and channel.
struct ActiveChat {
    chat_id: String,
    other: User,
    store: MessageStore,
    subscription: Option<ChatSubscription>,
    live: bool,
    generation: u64,
}

struct IvyApp {
    cfg: Config,
    api: ApiClient,
    session: Session,
    view: View,
    email_or_username: String,
    password: String,
    chats: Vec<Chat>,
    users: Vec<User>,
    active: Option<ActiveChat>,
    message_input: String,
    composing: bool,
    search_input: String,
    status: String,
    events: Arc<Mutex<Option<mpsc::UnboundedReceiver<ChatEvent>>>>,
    generation: u64,
    redial: RedialGate,
    scroll_id: scrollable::Id,
}

#[derive(Default, Clone, PartialEq)]
enum View {
    #[default]
    Login,
    Messages,
}

#[derive(Debug, Clone)]
enum AppMessage {
    EmailChanged(String),
    PasswordChanged(String),
    SubmitLogin,
    LoggedIn(Result<(String, User), String>),
    CableReady(Result<CableConnection, String>),
    ChatsLoaded(Result<Vec<Chat>, String>),
    UsersLoaded(Result<Vec<User>, String>),
    SelectChat(String),
    HistoryLoaded {
        chat_id: String,
        result: Result<ChatHistory, String>,
    },
    SubscriptionOpened {
        chat_id: String,
        generation: u64,
        result: Result<OpenedChannel, String>,
    },
    MessageInputChanged(String),
    SubmitMessage,
    RestSendFinished {
        chat_id: String,
        result: Result<WireMessage, String>,
    },
    Cable(ChatEvent),
    PumpIdle,
    RedialTick,
    ScrollTick,
    ToggleCompose,
    SearchChanged(String),
    StartChat(String),
    ChatCreated {
        counterpart: String,
        result: Result<Chat, String>,
    },
    Logout,
}

impl Application for IvyApp {
    type Executor = iced::executor::Default;
    type Message = AppMessage;
    type Theme = Theme;
    type Flags = ();

    fn new(_flags: ()) -> (Self, Command<AppMessage>) {
        let cfg = Config::from_env();
        let api = ApiClient::new(cfg.api_url.clone());
        (
            IvyApp {
                cfg,
                api,
                session: Session::new(),
                view: View::Login,
                email_or_username: String::new(),
                password: String::new(),
                chats: vec![],
                users: vec![],
                active: None,
                message_input: String::new(),
                composing: false,
                search_input: String::new(),
                status: String::new(),
                events: Arc::new(Mutex::new(None)),
                generation: 0,
                redial: RedialGate::new(),
                scroll_id: scrollable::Id::new("messages_scroll"),
            },
            Command::none(),
        )
    }

    fn title(&self) -> String {
        String::from("IvyChat")
    }

    fn update(&mut self, message: AppMessage) -> Command<AppMessage> {
        match message {
            AppMessage::EmailChanged(value) => {
                self.email_or_username = value;
                Command::none()
            }
            AppMessage::PasswordChanged(value) => {
                self.password = value;
                Command::none()
            }
            AppMessage::SubmitLogin => {
                if self.email_or_username.is_empty() || self.password.is_empty() {
                    self.status = "Email/username and password required".to_string();
                    return Command::none();
                }
                self.status = "Signing in...".to_string();
                let api = self.api.clone();
                let who = self.email_or_username.clone();
                let password = self.password.clone();
                Command::perform(
                    async move {
                        let login = api.login(&who, &password).await?;
                        let user = match login.user {
                            Some(user) => user,
                            None => {
                                let authed = api.with_token(login.token.clone());
                                authed.current_user().await?
                            }
                        };
                        Ok((login.token, user))
                    },
                    |result: anyhow::Result<(String, User)>| {
                        AppMessage::LoggedIn(result.map_err(|e| e.to_string()))
                    },
                )
            }
            AppMessage::LoggedIn(Ok((token, user))) => {
                self.api.set_token(Some(token.clone()));
                self.session.log_in(token, user);
                self.password.clear();
                self.status.clear();
                self.view = View::Messages;
                Command::batch(vec![
                    self.fetch_chats(),
                    self.fetch_users(),
                    self.dial_cable(),
                ])
            }
            AppMessage::LoggedIn(Err(e)) => {
                self.status = format!("Login failed: {e}");
                Command::none()
            }
            AppMessage::CableReady(Ok(conn)) => {
                self.session.attach_connection(conn);
                // A conversation opened while offline gets its channel now.
                if self
                    .active
                    .as_ref()
                    .is_some_and(|a| a.subscription.is_none())
                {
                    self.open_subscription()
                } else {
                    Command::none()
                }
            }
            AppMessage::CableReady(Err(e)) => {
                log::warn!("cable dial failed: {}", e);
                self.status = "Realtime unavailable, messages go over REST".to_string();
                self.schedule_redial()
            }
            AppMessage::ChatsLoaded(Ok(chats)) => {
                self.chats = chats;
                Command::none()
            }
            AppMessage::ChatsLoaded(Err(e)) => {
                self.status = format!("Could not load conversations: {e}");
                Command::none()
            }
            AppMessage::UsersLoaded(Ok(users)) => {
                self.users = users;
                Command::none()
            }
            AppMessage::UsersLoaded(Err(e)) => {
                log::warn!("user roster fetch failed: {}", e);
                Command::none()
            }
            AppMessage::SelectChat(chat_id) => self.select_chat(chat_id),
            AppMessage::HistoryLoaded { chat_id, result } => {
                match result {
                    Ok(history) => {
                        {
                            let Some(active) = &mut self.active else {
                                return Command::none();
                            };
                            if active.chat_id != chat_id {
                                return Command::none();
                            }
                            let Some(me) = self.session.current_user() else {
                                return Command::none();
                            };
                            let current = Sender::from(me);
                            let other = Sender::from(&active.other);
                            let ctx = NormalizeContext {
                                chat_id: &chat_id,
                                current_user: &current,
                                other_user: &other,
                                now: Utc::now(),
                            };
                            let messages = history
                                .messages
                                .into_iter()
                                .filter_map(|wire| history_message(wire, &ctx))
                                .collect();
                            active.store.load_history(messages);
                        }
                        self.scroll_command()
                    }
                    Err(e) => {
                        self.status = format!("Could not load history: {e}");
                        Command::none()
                    }
                }
            }
            AppMessage::SubscriptionOpened {
                chat_id,
                generation,
                result,
            } => match result {
                Ok(handoff) => {
                    let stale = self
                        .active
                        .as_ref()
                        .map_or(true, |a| a.chat_id != chat_id || a.generation != generation);
                    if stale {
                        // The user moved on while the open was in flight.
                        if let Some((sub, _rx)) = handoff.take() {
                            sub.close();
                        }
                        return Command::none();
                    }
                    if let Some((sub, rx)) = handoff.take() {
                        if let Some(active) = &mut self.active {
                            active.subscription = Some(sub);
                        }
                        *self.events.blocking_lock() = Some(rx);
                    }
                    Command::none()
                }
                Err(e) => {
                    log::warn!("chat {}: subscription open failed: {}", chat_id, e);
                    self.status = "Realtime unavailable, messages go over REST".to_string();
                    self.schedule_redial()
                }
            },
            AppMessage::MessageInputChanged(value) => {
                self.message_input = value;
                Command::none()
            }
            AppMessage::SubmitMessage => {
                let text = self.message_input.trim().to_string();
                if text.is_empty() {
                    return Command::none();
                }
                let Some(me) = self.session.current_user() else {
                    return Command::none();
                };
                let sender = Sender::from(me);

                // Local append first; the network send is a separate,
                // fallible step (failure never removes the echo).
                let (chat_id, over_ws) = {
                    let Some(active) = &mut self.active else {
                        return Command::none();
                    };
                    active.store.append_optimistic(&text, &sender, Utc::now());
                    let over_ws = active.live
                        && active.subscription.as_ref().is_some_and(|sub| {
                            match sub.send(&text) {
                                Ok(()) => true,
                                Err(e) => {
                                    log::warn!("push send failed, using REST: {}", e);
                                    false
                                }
                            }
                        });
                    (active.chat_id.clone(), over_ws)
                };
                self.message_input.clear();

                let mut commands = vec![self.scroll_command()];
                if !over_ws {
                    let api = self.api.clone();
                    let for_msg = chat_id.clone();
                    commands.push(Command::perform(
                        async move { api.send_chat_message(&chat_id, &text).await },
                        move |result| AppMessage::RestSendFinished {
                            chat_id: for_msg,
                            result: result.map_err(|e| e.to_string()),
                        },
                    ));
                }
                Command::batch(commands)
            }
            AppMessage::RestSendFinished { chat_id, result } => match result {
                Ok(wire) => {
                    let applied = {
                        let Some(active) = &mut self.active else {
                            return Command::none();
                        };
                        if active.chat_id != chat_id {
                            return Command::none();
                        }
                        let Some(me) = self.session.current_user() else {
                            return Command::none();
                        };
                        let current = Sender::from(me);
                        let other = Sender::from(&active.other);
                        let ctx = NormalizeContext {
                            chat_id: &chat_id,
                            current_user: &current,
                            other_user: &other,
                            now: Utc::now(),
                        };
                        match history_message(wire, &ctx) {
                            Some(confirmed) => active.store.append(confirmed),
                            None => false,
                        }
                    };
                    if applied {
                        self.scroll_command()
                    } else {
                        Command::none()
                    }
                }
                Err(e) => {
                    // Optimistic entry stays visible rather than vanishing.
                    self.status = format!("Send failed, message not delivered: {e}");
                    Command::none()
                }
            },
            AppMessage::Cable(event) => self.handle_cable_event(event),
            AppMessage::PumpIdle => Command::none(),
            AppMessage::RedialTick => {
                let wants = self.wants_realtime();
                let socket_up = self.session.connection().is_some();
                match self.redial.on_elapsed(wants, socket_up) {
                    RedialStep::Idle => Command::none(),
                    RedialStep::Dial => self.dial_cable(),
                    RedialStep::OpenChannel => self.open_subscription(),
                }
            }
            AppMessage::ScrollTick => self.scroll_command(),
            AppMessage::ToggleCompose => {
                self.composing = !self.composing;
                self.search_input.clear();
                Command::none()
            }
            AppMessage::SearchChanged(value) => {
                self.search_input = value;
                Command::none()
            }
            AppMessage::StartChat(user_id) => {
                self.composing = false;
                let api = self.api.clone();
                let counterpart = user_id.clone();
                Command::perform(
                    async move { api.create_chat(&user_id).await },
                    move |result| AppMessage::ChatCreated {
                        counterpart,
                        result: result.map_err(|e| e.to_string()),
                    },
                )
            }
            AppMessage::ChatCreated {
                counterpart,
                result,
            } => match result {
                Ok(mut chat) => {
                    if chat.other_user.is_none() {
                        chat.other_user =
                            self.users.iter().find(|u| u.id == counterpart).cloned();
                    }
                    let id = chat.id.clone();
                    if let Some(pos) = self.chats.iter().position(|c| c.id == chat.id) {
                        self.chats[pos] = chat;
                    } else {
                        self.chats.insert(0, chat);
                    }
                    Command::perform(async move { AppMessage::SelectChat(id) }, |msg| msg)
                }
                Err(e) => {
                    self.status = format!("Could not start conversation: {e}");
                    Command::none()
                }
            },
            AppMessage::Logout => {
                if let Some(active) = &mut self.active {
                    if let Some(sub) = active.subscription.take() {
                        sub.close();
                    }
                }
                self.active = None;
                self.clear_events();
                self.session.log_out();
                self.api.set_token(None);
                self.chats.clear();
                self.users.clear();
                self.message_input.clear();
                self.composing = false;
                self.search_input.clear();
                self.status = "Signed out".to_string();
                self.view = View::Login;
                Command::none()
            }
        }
    }

    fn view(&self) -> Element<AppMessage> {
        match self.view {
            View::Login => self.login_view(),
            View::Messages => self.messages_view(),
        }
    }

    fn subscription(&self) -> Subscription<AppMessage> {
        struct CablePump;

        iced::subscription::unfold(
            TypeId::of::<CablePump>(),
            Arc::clone(&self.events),
            |events| async move {
                let message = {
                    let mut slot = events.lock().await;
                    match slot.as_mut() {
                        Some(rx) => match rx.recv().await {
                            Some(event) => Some(AppMessage::Cable(event)),
                            None => {
                                // Sender dropped with a closed subscription.
                                *slot = None;
                                Some(AppMessage::PumpIdle)
                            }
                        },
                        None => None,
                    }
                };
                let message = match message {
                    Some(message) => message,
                    None => {
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        AppMessage::PumpIdle
                    }
                };
                (message, events)
            },
        )
    }
}

impl IvyApp {
    fn fetch_chats(&self) -> Command<AppMessage> {
        let api = self.api.clone();
        Command::perform(async move { api.get_chats().await }, |result| {
            AppMessage::ChatsLoaded(result.map_err(|e| e.to_string()))
        })
    }

    fn fetch_users(&self) -> Command<AppMessage> {
        let api = self.api.clone();
        Command::perform(async move { api.get_users().await }, |result| {
            AppMessage::UsersLoaded(result.map_err(|e| e.to_string()))
        })
    }

    fn dial_cable(&self) -> Command<AppMessage> {
        let Some(token) = self.session.token() else {
            // No credential means REST-only mode.
            return Command::none();
        };
        let token = token.to_string();
        let cable_url = self.cfg.cable_url.clone();
        Command::perform(
            async move { CableConnection::connect(&cable_url, &token).await },
            |result| AppMessage::CableReady(result.map_err(|e| e.to_string())),
        )
    }

    /// True while the conversation on screen is missing its live channel.
    fn wants_realtime(&self) -> bool {
        self.session.is_authenticated()
            && self
                .active
                .as_ref()
                .is_some_and(|a| a.subscription.is_none())
    }

    /// Starts the redial delay after a failed dial or channel open. The gate
    /// keeps a single tick in flight however many failures land meanwhile.
    fn schedule_redial(&mut self) -> Command<AppMessage> {
        let wants = self.wants_realtime();
        if !self.redial.arm(wants) {
            return Command::none();
        }
        let delay = self.cfg.reconnect_delay;
        Command::perform(
            async move {
                tokio::time::sleep(delay).await;
            },
            |_| AppMessage::RedialTick,
        )
    }

    fn select_chat(&mut self, chat_id: String) -> Command<AppMessage> {
        // Tear the previous channel down before anything async begins; two
        // live subscriptions must never overlap.
        if let Some(active) = &mut self.active {
            if let Some(sub) = active.subscription.take() {
                sub.close();
            }
        }
        self.clear_events();

        let Some(other) = self
            .chats
            .iter()
            .find(|c| c.id == chat_id)
            .and_then(|c| c.other_user.clone())
        else {
            self.status = "Conversation partner unknown".to_string();
            return Command::none();
        };

        self.active = Some(ActiveChat {
            chat_id: chat_id.clone(),
            other,
            store: MessageStore::new(&chat_id, &self.cfg),
            subscription: None,
            live: false,
            generation: 0,
        });
        self.message_input.clear();
        self.composing = false;
        self.status.clear();

        let mut commands = vec![self.fetch_history(chat_id)];
        if self.session.connection().is_some() {
            commands.push(self.open_subscription());
        } else if self.session.needs_connection() {
            commands.push(self.dial_cable());
        }
        Command::batch(commands)
    }

    fn fetch_history(&self, chat_id: String) -> Command<AppMessage> {
        let api = self.api.clone();
        let for_msg = chat_id.clone();
        Command::perform(
            async move { api.get_chat(&chat_id).await },
            move |result| AppMessage::HistoryLoaded {
                chat_id: for_msg,
                result: result.map_err(|e| e.to_string()),
            },
        )
    }

    fn open_subscription(&mut self) -> Command<AppMessage> {
        let Some(conn) = self.session.connection().cloned() else {
            return Command::none();
        };
        let Some(active) = &mut self.active else {
            return Command::none();
        };
        self.generation += 1;
        active.generation = self.generation;

        let generation = self.generation;
        let chat_id = active.chat_id.clone();
        let for_msg = chat_id.clone();
        let cfg = self.cfg.clone();
        Command::perform(
            async move { ChatSubscription::open(conn, &chat_id, generation, &cfg).await },
            move |result| AppMessage::SubscriptionOpened {
                chat_id: for_msg,
                generation,
                result: result.map(Handoff::new).map_err(|e| e.to_string()),
            },
        )
    }

    fn handle_cable_event(&mut self, event: ChatEvent) -> Command<AppMessage> {
        match event {
            ChatEvent::Connected { chat_id } => {
                if let Some(active) = &mut self.active {
                    if active.chat_id == chat_id {
                        active.live = true;
                        self.status.clear();
                    }
                }
                Command::none()
            }
            ChatEvent::Disconnected { chat_id } => {
                if let Some(active) = &mut self.active {
                    if active.chat_id == chat_id {
                        active.live = false;
                        self.status = "Connection lost, reconnecting...".to_string();
                    }
                }
                Command::none()
            }
            ChatEvent::Payload { chat_id, data } => {
                let applied = {
                    let Some(active) = &mut self.active else {
                        return Command::none();
                    };
                    if active.chat_id != chat_id {
                        return Command::none();
                    }
                    let Some(me) = self.session.current_user() else {
                        return Command::none();
                    };
                    let current = Sender::from(me);
                    let other = Sender::from(&active.other);
                    let ctx = NormalizeContext {
                        chat_id: &chat_id,
                        current_user: &current,
                        other_user: &other,
                        now: Utc::now(),
                    };
                    match normalize(&data, &ctx) {
                        Inbound::Message(message) => active.store.append(message),
                        Inbound::Control(_) | Inbound::Discard => false,
                    }
                };
                if applied {
                    self.scroll_command()
                } else {
                    Command::none()
                }
            }
            ChatEvent::Retry {
                chat_id,
                generation,
            } => {
                let current = self
                    .active
                    .as_ref()
                    .is_some_and(|a| a.chat_id == chat_id && a.generation == generation);
                if !current || !self.session.is_authenticated() {
                    log::debug!("ignoring stale retry for chat {}", chat_id);
                    return Command::none();
                }
                if let Some(active) = &mut self.active {
                    if let Some(sub) = active.subscription.take() {
                        sub.close();
                    }
                }
                self.clear_events();
                if self.session.connection().is_some() {
                    self.open_subscription()
                } else {
                    self.dial_cable()
                }
            }
        }
    }

    /// Fires the debounced autoscroll, or schedules a trailing check when a
    /// nudge landed mid-window.
    fn scroll_command(&mut self) -> Command<AppMessage> {
        let debounce = self.cfg.scroll_debounce;
        let Some(active) = &mut self.active else {
            return Command::none();
        };
        if active.store.take_scroll(Instant::now()) {
            scrollable::snap_to(
                self.scroll_id.clone(),
                scrollable::RelativeOffset { x: 0.0, y: 1.0 },
            )
        } else if active.store.scroll_pending() {
            Command::perform(
                async move {
                    tokio::time::sleep(debounce).await;
                },
                |_| AppMessage::ScrollTick,
            )
        } else {
            Command::none()
        }
    }

    fn clear_events(&self) {
        // A pump blocked on the old receiver wakes and releases the lock
        // once the closed subscription drops its sender.
        *self.events.blocking_lock() = None;
    }

    fn login_view(&self) -> Element<AppMessage> {
        let email_input = text_input("Email or username", &self.email_or_username)
            .on_input(AppMessage::EmailChanged)
            .padding(10)
            .width(Length::Fixed(300.0))
            .style(theme::TextInput::Default);
        let password_input = text_input("Password", &self.password)
            .on_input(AppMessage::PasswordChanged)
            .on_submit(AppMessage::SubmitLogin)
            .secure(true)
            .padding(10)
            .width(Length::Fixed(300.0))
            .style(theme::TextInput::Default);

        let login_button = button("Sign in").on_press(AppMessage::SubmitLogin).padding(10);
        let status = text(&self.status).size(16);

        container(
            column![
                text("IvyChat").size(30),
                email_input,
                password_input,
                login_button,
                status
            ]
            .spacing(20)
            .align_items(Alignment::Center),
        )
        .center_x()
        .center_y()
        .width(Length::Fill)
        .height(Length::Fill)
        .into()
    }

    fn messages_view(&self) -> Element<AppMessage> {
        let chat_buttons = self
            .chats
            .iter()
            .map(|chat| {
                let name = chat
                    .other_user
                    .as_ref()
                    .map(|u| u.username.as_str())
                    .unwrap_or("Unknown");
                let preview = chat
                    .last_message
                    .as_ref()
                    .map(|m| clip(&m.content, 28))
                    .unwrap_or_default();
                let label = column![
                    text(name).size(16),
                    text(preview).size(12).style(Color::from_rgb(0.5, 0.5, 0.5)),
                ]
                .spacing(2);
                Button::new(label)
                    .on_press(AppMessage::SelectChat(chat.id.clone()))
                    .padding(8)
                    .width(Length::Fill)
                    .into()
            })
            .collect::<Vec<_>>();

        let sidebar = column![
            row![
                text("Messages").size(22),
                button("New").on_press(AppMessage::ToggleCompose).padding(6),
            ]
            .spacing(10)
            .align_items(Alignment::Center),
            scrollable(column(chat_buttons).spacing(4)).height(Length::Fill),
            button("Logout").on_press(AppMessage::Logout).padding(8),
        ]
        .spacing(12)
        .padding(10)
        .width(Length::Fixed(240.0));

        let detail: Element<AppMessage> = if self.composing {
            self.compose_view()
        } else if self.active.is_some() {
            self.conversation_view()
        } else {
            container(text("Select a conversation or start a new one").size(18))
                .center_x()
                .center_y()
                .width(Length::Fill)
                .height(Length::Fill)
                .into()
        };

        let status = text(&self.status)
            .size(14)
            .style(Color::from_rgb(0.8, 0.3, 0.3));

        container(
            column![
                row![
                    sidebar,
                    container(detail).width(Length::Fill).height(Length::Fill)
                ]
                .spacing(10)
                .height(Length::Fill),
                status
            ]
            .spacing(8)
            .padding(10),
        )
        .width(Length::Fill)
        .height(Length::Fill)
        .into()
    }

    fn compose_view(&self) -> Element<AppMessage> {
        let me_id = self
            .session
            .current_user()
            .map(|u| u.id.clone())
            .unwrap_or_default();
        let needle = self.search_input.to_lowercase();

        let matches = self
            .users
            .iter()
            .filter(|u| u.id != me_id)
            .filter(|u| needle.is_empty() || u.username.to_lowercase().contains(&needle))
            .map(|u| {
                Button::new(text(&u.username).size(16))
                    .on_press(AppMessage::StartChat(u.id.clone()))
                    .padding(6)
                    .width(Length::Fill)
                    .into()
            })
            .collect::<Vec<_>>();

        column![
            row![
                text("New conversation").size(20),
                button("Cancel").on_press(AppMessage::ToggleCompose).padding(6),
            ]
            .spacing(10)
            .align_items(Alignment::Center),
            text_input("Search people", &self.search_input)
                .on_input(AppMessage::SearchChanged)
                .padding(10)
                .style(theme::TextInput::Default),
            scrollable(column(matches).spacing(4)).height(Length::Fill),
        ]
        .spacing(12)
        .padding(10)
        .into()
    }

    fn conversation_view(&self) -> Element<AppMessage> {
        let Some(active) = &self.active else {
            return column![].into();
        };
        let me_id = self
            .session
            .current_user()
            .map(|u| u.id.clone())
            .unwrap_or_default();

        let bubbles = active
            .store
            .messages()
            .iter()
            .map(|msg| {
                let own = msg.user_id == me_id;
                let bubble = column![
                    text(&msg.content).size(16),
                    text(format_timestamp(&msg.created_at))
                        .size(11)
                        .style(Color::from_rgb(0.45, 0.45, 0.45)),
                ]
                .spacing(2);

                container(
                    container(bubble)
                        .padding(10)
                        .max_width(420)
                        .style(move |_theme: &Theme| container::Appearance {
                            background: Some(Background::Color(if own {
                                Color::from_rgb(0.76, 0.93, 0.79)
                            } else {
                                Color::from_rgb(0.95, 0.95, 0.95)
                            })),
                            border: iced::Border {
                                color: Color::from_rgb(0.8, 0.8, 0.8),
                                width: 1.0,
                                radius: 10.0.into(),
                            },
                            ..Default::default()
                        }),
                )
                .width(Length::Fill)
                .align_x(if own { Horizontal::Right } else { Horizontal::Left })
                .into()
            })
            .collect::<Vec<Element<AppMessage>>>();

        let presence = if active.live {
            text("online").size(12).style(Color::from_rgb(0.2, 0.6, 0.3))
        } else {
            text("offline").size(12).style(Color::from_rgb(0.5, 0.5, 0.5))
        };

        let header = row![text(&active.other.username).size(20), presence]
            .spacing(10)
            .align_items(Alignment::Center);

        let transcript = scrollable(column(bubbles).spacing(6).padding(10))
            .id(self.scroll_id.clone())
            .height(Length::Fill);

        let input_row = row![
            text_input("Type a message...", &self.message_input)
                .on_input(AppMessage::MessageInputChanged)
                .on_submit(AppMessage::SubmitMessage)
                .padding(10)
                .style(theme::TextInput::Default),
            button("Send").on_press(AppMessage::SubmitMessage).padding(10),
        ]
        .spacing(8)
        .align_items(Alignment::Center);

        column![header, transcript, input_row]
            .spacing(10)
            .padding(10)
            .into()
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max).collect::<String>())
    }
}

fn format_timestamp(created_at: &str) -> String {
    let Ok(parsed) = DateTime::parse_from_rfc3339(created_at) else {
        // Unstamped history rows render without a time.
        return String::new();
    };
    let local: DateTime<Local> = parsed.with_timezone(&Local);
    let now = Local::now();
    let today = now.date_naive();
    let message_date = local.date_naive();

    if message_date == today {
        local.format("%I:%M %p").to_string()
    } else if (today - message_date).num_days() == 1 {
        format!("Yesterday, {}", local.format("%I:%M %p"))
    } else {
        local.format("%b %d, %I:%M %p").to_string()
    }
}

fn main() -> iced::Result {
    dotenv().ok();
    env_logger::init();
    IvyApp::run(Settings::default())
}
