//! A small blog-shaped fixture graph:
//!
//! ```text
//! Root --posts--> Posts --get(id)--> Post --author--> User
//!      --users--> Users
//! ```
//!
//! `Posts.count()` and `Posts.slow()` are methods; `Post.setTitle(title)`
//! mutates the shared store and returns a reference to the post's canonical
//! path, which is how read-after-write is exercised end to end.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use trellis_codec::Value;
use trellis_server::{
    ClassDef, ClassRegistry, ConfigError, GraphNode, HandlerError, NodeRef, OpContext, Server,
    ServerConfig, validators,
};

#[derive(Debug, Clone)]
pub struct PostRecord {
    pub id: String,
    pub title: String,
    pub author: String,
}

/// Shared mutable post store; mutations are visible to later resolutions.
#[derive(Clone, Default)]
pub struct BlogStore {
    inner: Arc<Mutex<HashMap<String, PostRecord>>>,
}

impl BlogStore {
    pub fn seeded() -> BlogStore {
        let store = BlogStore::default();
        store.insert(PostRecord {
            id: "1".to_owned(),
            title: "Original".to_owned(),
            author: "ada".to_owned(),
        });
        store.insert(PostRecord {
            id: "2".to_owned(),
            title: "Second".to_owned(),
            author: "grace".to_owned(),
        });
        store
    }

    pub fn insert(&self, record: PostRecord) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<PostRecord> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn set_title(&self, id: &str, title: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.get_mut(id) {
            Some(record) => {
                record.title = title.to_owned();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn blog_registry() -> ClassRegistry {
    ClassRegistry::new("Root")
        .class(
            ClassDef::new("Root")
                .edge("posts", "Posts")
                .edge("users", "Users"),
        )
        .class(
            ClassDef::new("Posts")
                .edge("get", "Post")
                .method("count", vec![])
                .method("slow", vec![]),
        )
        .class(
            ClassDef::new("Post")
                .edge("author", "User")
                .method("setTitle", vec![validators::string()])
                .canonical(|rec, args| {
                    rec.seg("posts").call("get", args.to_vec());
                }),
        )
        .class(ClassDef::new("Users").method("count", vec![]))
        .class(ClassDef::new("User"))
}

pub fn blog_root(store: BlogStore) -> NodeRef {
    Arc::new(RootNode { store })
}

/// A ready-to-serve blog server over a seeded store.
pub fn blog_server(config: ServerConfig) -> Result<(Server, BlogStore), ConfigError> {
    let store = BlogStore::seeded();
    let root_store = store.clone();
    let server = Server::builder()
        .registry(blog_registry())
        .config(config)
        .root(move |_| blog_root(root_store.clone()))
        .build()?;
    Ok((server, store))
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

struct RootNode {
    store: BlogStore,
}

impl GraphNode for RootNode {
    fn class_name(&self) -> &str {
        "Root"
    }

    fn edge(
        &self,
        name: &str,
        _args: Vec<Value>,
        _ctx: OpContext,
    ) -> BoxFuture<'static, Result<NodeRef, HandlerError>> {
        let store = self.store.clone();
        let name = name.to_owned();
        async move {
            match name.as_str() {
                "posts" => Ok(Arc::new(PostsNode { store }) as NodeRef),
                "users" => Ok(Arc::new(UsersNode) as NodeRef),
                other => Err(HandlerError::msg(format!("no edge '{other}'"))),
            }
        }
        .boxed()
    }

    fn call(
        &self,
        name: &str,
        _args: Vec<Value>,
        _ctx: OpContext,
    ) -> BoxFuture<'static, Result<Value, HandlerError>> {
        let name = name.to_owned();
        async move { Err(HandlerError::msg(format!("no method '{name}'"))) }.boxed()
    }

    fn get(&self, _name: &str) -> Option<Value> {
        None
    }

    fn snapshot(&self) -> Result<Value, HandlerError> {
        Ok(Value::object(vec![]))
    }
}

struct PostsNode {
    store: BlogStore,
}

impl GraphNode for PostsNode {
    fn class_name(&self) -> &str {
        "Posts"
    }

    fn edge(
        &self,
        name: &str,
        args: Vec<Value>,
        _ctx: OpContext,
    ) -> BoxFuture<'static, Result<NodeRef, HandlerError>> {
        let store = self.store.clone();
        let name = name.to_owned();
        async move {
            if name != "get" {
                return Err(HandlerError::msg(format!("no edge '{name}'")));
            }
            let id = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::msg("get(id) requires a string id"))?
                .to_owned();
            if store.get(&id).is_none() {
                return Err(HandlerError::msg(format!("Post {id} not found")));
            }
            Ok(Arc::new(PostNode { store, id }) as NodeRef)
        }
        .boxed()
    }

    fn call(
        &self,
        name: &str,
        _args: Vec<Value>,
        _ctx: OpContext,
    ) -> BoxFuture<'static, Result<Value, HandlerError>> {
        let store = self.store.clone();
        let name = name.to_owned();
        async move {
            match name.as_str() {
                "count" => Ok(Value::Int(store.len() as i64)),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(Value::Int(1))
                }
                other => Err(HandlerError::msg(format!("no method '{other}'"))),
            }
        }
        .boxed()
    }

    fn get(&self, _name: &str) -> Option<Value> {
        None
    }

    fn snapshot(&self) -> Result<Value, HandlerError> {
        Ok(Value::object(vec![("kind", Value::str("posts"))]))
    }
}

struct PostNode {
    store: BlogStore,
    id: String,
}

impl GraphNode for PostNode {
    fn class_name(&self) -> &str {
        "Post"
    }

    fn edge(
        &self,
        name: &str,
        _args: Vec<Value>,
        _ctx: OpContext,
    ) -> BoxFuture<'static, Result<NodeRef, HandlerError>> {
        let store = self.store.clone();
        let id = self.id.clone();
        let name = name.to_owned();
        async move {
            if name != "author" {
                return Err(HandlerError::msg(format!("no edge '{name}'")));
            }
            let record = store
                .get(&id)
                .ok_or_else(|| HandlerError::msg(format!("Post {id} vanished")))?;
            Ok(Arc::new(UserNode {
                name: record.author,
            }) as NodeRef)
        }
        .boxed()
    }

    fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        ctx: OpContext,
    ) -> BoxFuture<'static, Result<Value, HandlerError>> {
        let store = self.store.clone();
        let id = self.id.clone();
        let name = name.to_owned();
        async move {
            match name.as_str() {
                "setTitle" => {
                    let title = args
                        .first()
                        .and_then(Value::as_str)
                        .ok_or_else(|| HandlerError::msg("setTitle requires a string"))?;
                    if !store.set_title(&id, title) {
                        return Err(HandlerError::msg(format!("Post {id} vanished")));
                    }
                    // Read-after-write: hand back a reference so the client
                    // refreshes its caches for this post.
                    ctx.reference("Post", &[Value::str(id)]).await
                }
                other => Err(HandlerError::msg(format!("no method '{other}'"))),
            }
        }
        .boxed()
    }

    fn get(&self, name: &str) -> Option<Value> {
        let record = self.store.get(&self.id)?;
        match name {
            "id" => Some(Value::str(record.id)),
            "title" => Some(Value::str(record.title)),
            _ => None,
        }
    }

    fn snapshot(&self) -> Result<Value, HandlerError> {
        let record = self
            .store
            .get(&self.id)
            .ok_or_else(|| HandlerError::msg(format!("Post {} vanished", self.id)))?;
        Ok(Value::object(vec![
            ("id", Value::str(record.id)),
            ("title", Value::str(record.title)),
        ]))
    }
}

struct UsersNode;

impl GraphNode for UsersNode {
    fn class_name(&self) -> &str {
        "Users"
    }

    fn edge(
        &self,
        name: &str,
        _args: Vec<Value>,
        _ctx: OpContext,
    ) -> BoxFuture<'static, Result<NodeRef, HandlerError>> {
        let name = name.to_owned();
        async move { Err(HandlerError::msg(format!("no edge '{name}'"))) }.boxed()
    }

    fn call(
        &self,
        name: &str,
        _args: Vec<Value>,
        _ctx: OpContext,
    ) -> BoxFuture<'static, Result<Value, HandlerError>> {
        let name = name.to_owned();
        async move {
            match name.as_str() {
                "count" => Ok(Value::Int(2)),
                other => Err(HandlerError::msg(format!("no method '{other}'"))),
            }
        }
        .boxed()
    }

    fn get(&self, _name: &str) -> Option<Value> {
        None
    }

    fn snapshot(&self) -> Result<Value, HandlerError> {
        Ok(Value::object(vec![]))
    }
}

struct UserNode {
    name: String,
}

impl GraphNode for UserNode {
    fn class_name(&self) -> &str {
        "User"
    }

    fn edge(
        &self,
        name: &str,
        _args: Vec<Value>,
        _ctx: OpContext,
    ) -> BoxFuture<'static, Result<NodeRef, HandlerError>> {
        let name = name.to_owned();
        async move { Err(HandlerError::msg(format!("no edge '{name}'"))) }.boxed()
    }

    fn call(
        &self,
        name: &str,
        _args: Vec<Value>,
        _ctx: OpContext,
    ) -> BoxFuture<'static, Result<Value, HandlerError>> {
        let name = name.to_owned();
        async move { Err(HandlerError::msg(format!("no method '{name}'"))) }.boxed()
    }

    fn get(&self, name: &str) -> Option<Value> {
        match name {
            "name" => Some(Value::str(self.name.clone())),
            _ => None,
        }
    }

    fn snapshot(&self) -> Result<Value, HandlerError> {
        Ok(Value::object(vec![("name", Value::str(self.name.clone()))]))
    }
}
