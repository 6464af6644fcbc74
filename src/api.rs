//! REST client for the forum and chat API. Thin wrappers per endpoint; the
//! server's JSON quirks are absorbed by the models, not here.

use anyhow::{anyhow, Context, Result};
use reqwest::{multipart, Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::models::{
    Chat, ChatHistory, Comment, Community, LoginResponse, Post, User, WireMessage,
};

/// In-memory file destined for a multipart field.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// One base URL plus an optional bearer token. Cloning is cheap; the
/// underlying connection pool is shared across clones.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base: String,
    token: Option<String>,
    http: Client,
}

impl ApiClient {
    pub fn new(base: impl Into<String>) -> Self {
        ApiClient {
            base: base.into().trim_end_matches('/').to_string(),
            token: None,
            http: Client::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.base, path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    // Auth

    pub async fn login(&self, email_or_username: &str, password: &str) -> Result<LoginResponse> {
        let req = self.request(Method::POST, "/api/login").json(&json!({
            "email_or_username": email_or_username,
            "password": password,
        }));
        execute(req, "login").await
    }

    pub async fn current_user(&self) -> Result<User> {
        execute(self.request(Method::GET, "/api/me"), "fetch current user").await
    }

    pub async fn create_user(&self, username: &str, email: &str, password: &str) -> Result<User> {
        let req = self.request(Method::POST, "/api/users").json(&json!({
            "user": { "username": username, "email": email, "password": password }
        }));
        execute(req, "sign up").await
    }

    // Users

    pub async fn get_users(&self) -> Result<Vec<User>> {
        execute(self.request(Method::GET, "/api/users"), "fetch users").await
    }

    pub async fn get_user(&self, id: &str) -> Result<User> {
        execute(
            self.request(Method::GET, &format!("/api/users/{id}")),
            "fetch user",
        )
        .await
    }

    // Chats

    pub async fn get_chats(&self) -> Result<Vec<Chat>> {
        execute(self.request(Method::GET, "/api/chats"), "fetch chats").await
    }

    pub async fn get_chat(&self, id: &str) -> Result<ChatHistory> {
        execute(
            self.request(Method::GET, &format!("/api/chats/{id}")),
            "fetch chat history",
        )
        .await
    }

    /// Find-or-create the direct conversation with `user_id`.
    pub async fn create_chat(&self, user_id: &str) -> Result<Chat> {
        let req = self
            .request(Method::POST, "/api/chats")
            .json(&json!({ "user_id": user_id }));
        execute(req, "create chat").await
    }

    /// REST send, also the fallback when the push channel is down.
    pub async fn send_chat_message(&self, chat_id: &str, body: &str) -> Result<WireMessage> {
        let req = self
            .request(Method::POST, &format!("/api/chats/{chat_id}/messages"))
            .json(&json!({ "message": { "body": body } }));
        execute(req, "send message").await
    }

    // Communities

    pub async fn get_communities(&self) -> Result<Vec<Community>> {
        execute(
            self.request(Method::GET, "/api/communities"),
            "fetch communities",
        )
        .await
    }

    pub async fn get_community(&self, id: &str) -> Result<Community> {
        execute(
            self.request(Method::GET, &format!("/api/communities/{id}")),
            "fetch community",
        )
        .await
    }

    pub async fn get_community_posts(&self, id: &str) -> Result<Vec<Post>> {
        execute(
            self.request(Method::GET, &format!("/api/communities/{id}/posts")),
            "fetch community posts",
        )
        .await
    }

    pub async fn create_community(
        &self,
        name: &str,
        description: &str,
        profile_photo: Option<Upload>,
        banner: Option<Upload>,
    ) -> Result<Community> {
        let mut form = multipart::Form::new()
            .text("community[name]", name.to_string())
            .text("community[description]", description.to_string());
        if let Some(photo) = profile_photo {
            form = form.part(
                "community[profile_photo]",
                multipart::Part::bytes(photo.bytes).file_name(photo.filename),
            );
        }
        if let Some(banner) = banner {
            form = form.part(
                "community[banner]",
                multipart::Part::bytes(banner.bytes).file_name(banner.filename),
            );
        }
        let req = self.request(Method::POST, "/api/communities").multipart(form);
        execute(req, "create community").await
    }

    // Posts

    pub async fn get_posts(&self) -> Result<Vec<Post>> {
        execute(self.request(Method::GET, "/api/posts"), "fetch posts").await
    }

    pub async fn get_post(&self, id: &str) -> Result<Post> {
        execute(
            self.request(Method::GET, &format!("/api/posts/{id}")),
            "fetch post",
        )
        .await
    }

    pub async fn create_post(
        &self,
        title: &str,
        content: &str,
        community_id: &str,
        user_id: &str,
        image: Option<Upload>,
    ) -> Result<Post> {
        let mut form = multipart::Form::new()
            .text("post[title]", title.to_string())
            .text("post[content]", content.to_string())
            .text("post[community_id]", community_id.to_string())
            .text("post[user_id]", user_id.to_string());
        if let Some(image) = image {
            form = form.part(
                "post[image]",
                multipart::Part::bytes(image.bytes).file_name(image.filename),
            );
        }
        let req = self.request(Method::POST, "/api/posts").multipart(form);
        execute(req, "create post").await
    }

    pub async fn delete_post(&self, id: &str) -> Result<()> {
        execute_empty(
            self.request(Method::DELETE, &format!("/api/posts/{id}")),
            "delete post",
        )
        .await
    }

    // Comments

    pub async fn get_post_comments(&self, post_id: &str) -> Result<Vec<Comment>> {
        execute(
            self.request(Method::GET, &format!("/api/posts/{post_id}/comments")),
            "fetch comments",
        )
        .await
    }

    pub async fn get_comment_replies(&self, comment_id: &str) -> Result<Vec<Comment>> {
        execute(
            self.request(Method::GET, &format!("/api/comments/{comment_id}/comments")),
            "fetch replies",
        )
        .await
    }

    pub async fn create_comment(
        &self,
        post_id: &str,
        content: &str,
        user_id: &str,
    ) -> Result<Comment> {
        let req = self
            .request(Method::POST, &format!("/api/posts/{post_id}/comments"))
            .json(&json!({ "comment": { "content": content, "user_id": user_id } }));
        execute(req, "create comment").await
    }

    pub async fn create_reply(
        &self,
        parent_id: &str,
        content: &str,
        user_id: &str,
    ) -> Result<Comment> {
        let req = self
            .request(Method::POST, &format!("/api/comments/{parent_id}/comments"))
            .json(&json!({ "comment": { "content": content, "user_id": user_id } }));
        execute(req, "create reply").await
    }

    pub async fn delete_comment(&self, id: &str) -> Result<()> {
        execute_empty(
            self.request(Method::DELETE, &format!("/api/comments/{id}")),
            "delete comment",
        )
        .await
    }

    // Upvotes. The response body shape varies between controllers, so it is
    // checked for status and otherwise ignored.

    pub async fn toggle_post_upvote(
        &self,
        post_id: &str,
        user_id: &str,
        upvoted: bool,
    ) -> Result<()> {
        let method = if upvoted { Method::DELETE } else { Method::POST };
        let req = self
            .request(method, &format!("/api/posts/{post_id}/upvotes"))
            .json(&json!({ "user_id": user_id }));
        execute_empty(req, "toggle post upvote").await
    }

    pub async fn toggle_comment_upvote(
        &self,
        comment_id: &str,
        user_id: &str,
        upvoted: bool,
    ) -> Result<()> {
        let method = if upvoted { Method::DELETE } else { Method::POST };
        let req = self
            .request(method, &format!("/api/comments/{comment_id}/upvotes"))
            .json(&json!({ "user_id": user_id }));
        execute_empty(req, "toggle comment upvote").await
    }
}

async fn execute<T: DeserializeOwned>(req: RequestBuilder, what: &str) -> Result<T> {
    let res = req
        .send()
        .await
        .with_context(|| format!("{what}: request failed"))?;
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!(
            "{} failed ({}): {}",
            what,
            status.as_u16(),
            truncate(&body, 400)
        ));
    }
    serde_json::from_str(&body).with_context(|| {
        format!(
            "{}: unexpected response shape: {}",
            what,
            truncate(&body, 400)
        )
    })
}

/// For endpoints whose success body is empty or irrelevant.
async fn execute_empty(req: RequestBuilder, what: &str) -> Result<()> {
    let res = req
        .send()
        .await
        .with_context(|| format!("{what}: request failed"))?;
    let status = res.status();
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(anyhow!(
            "{} failed ({}): {}",
            what,
            status.as_u16(),
            truncate(&body, 400)
        ));
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}
