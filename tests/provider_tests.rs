//! GitHub listing against a mock API server

use assert_matches::assert_matches;
use serde_json::{json, Value};
use syncreeper::{GitHubClient, ProviderError, RepositoryProvider};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "ghp_providertesttoken";

fn repo_json(full_name: &str, private: bool, archived: bool) -> Value {
    let name = full_name.split('/').nth(1).unwrap();
    json!({
        "id": full_name.len(),
        "name": name,
        "full_name": full_name,
        "url": format!("https://api.github.com/repos/{}", full_name),
        "clone_url": format!("https://github.com/{}.git", full_name),
        "ssh_url": format!("git@github.com:{}.git", full_name),
        "default_branch": "main",
        "private": private,
        "archived": archived
    })
}

async fn client(server: &MockServer) -> GitHubClient {
    GitHubClient::with_base_uri(TOKEN, Some("octocat".to_string()), &server.uri())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_lists_every_page_and_drops_archived() {
    let server = MockServer::start().await;
    let next = format!("<{}/user/repos?page=2>; rel=\"next\"", server.uri());

    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .and(query_param("page", "1"))
        .and(query_param("affiliation", "owner,collaborator,organization_member"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Link", next.as_str())
                .set_body_json(json!([
                    repo_json("octocat/hello", false, false),
                    repo_json("octocat/old-site", false, true),
                ])),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            repo_json("acme/secret", true, false),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let repositories = client(&server).await.list_repositories().await.unwrap();

    let names: Vec<_> = repositories.iter().map(|r| r.full_name.as_str()).collect();
    assert_eq!(names, vec!["octocat/hello", "acme/secret"]);
    assert!(repositories.iter().all(|r| !r.is_archived));
    assert!(repositories[1].is_private);
    assert_eq!(repositories[1].owner(), "acme");
    assert_eq!(repositories[0].clone_url, "https://github.com/octocat/hello.git");
}

#[tokio::test]
async fn test_requests_full_pages_of_all_visibilities() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .and(query_param("per_page", "100"))
        .and(query_param("visibility", "all"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server).await;
    assert_eq!(client.username(), "octocat");
    assert_eq!(client.provider_name(), "GitHub");
    assert!(client.list_repositories().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_credential_is_authentication_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "message": "Bad credentials",
            "documentation_url": "https://docs.github.com/rest"
        })))
        .mount(&server)
        .await;

    let err = client(&server).await.list_repositories().await.unwrap_err();
    assert_matches!(err, ProviderError::Authentication { status: 401, ref message } if message == "Bad credentials");
}

#[tokio::test]
async fn test_server_error_is_request_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user/repos"))
        .respond_with(ResponseTemplate::new(502).set_body_json(json!({
            "message": "Server Error",
            "documentation_url": "https://docs.github.com/rest"
        })))
        .mount(&server)
        .await;

    let err = client(&server).await.list_repositories().await.unwrap_err();
    assert_matches!(err, ProviderError::Request { page: 1, .. });
}

#[tokio::test]
async fn test_failed_user_lookup_is_not_a_page_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "message": "Not Found",
            "documentation_url": "https://docs.github.com/rest"
        })))
        .mount(&server)
        .await;

    let err = GitHubClient::with_base_uri(TOKEN, None, &server.uri())
        .await
        .err()
        .expect("lookup fails");
    assert_matches!(err, ProviderError::UserLookup(_));
    assert!(!err.to_string().contains("page"));
}

#[tokio::test]
async fn test_username_is_resolved_when_not_configured() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "login": "hubot",
            "id": 7,
            "node_id": "MDQ6VXNlcjc=",
            "avatar_url": "https://avatars.githubusercontent.com/u/7",
            "gravatar_id": "",
            "url": "https://api.github.com/users/hubot",
            "html_url": "https://github.com/hubot",
            "followers_url": "https://api.github.com/users/hubot/followers",
            "following_url": "https://api.github.com/users/hubot/following{/other_user}",
            "gists_url": "https://api.github.com/users/hubot/gists{/gist_id}",
            "starred_url": "https://api.github.com/users/hubot/starred{/owner}{/repo}",
            "subscriptions_url": "https://api.github.com/users/hubot/subscriptions",
            "organizations_url": "https://api.github.com/users/hubot/orgs",
            "repos_url": "https://api.github.com/users/hubot/repos",
            "events_url": "https://api.github.com/users/hubot/events{/privacy}",
            "received_events_url": "https://api.github.com/users/hubot/received_events",
            "type": "User",
            "site_admin": false
        })))
        .mount(&server)
        .await;

    let client = GitHubClient::with_base_uri(TOKEN, None, &server.uri())
        .await
        .unwrap();
    assert_eq!(client.username(), "hubot");
}
